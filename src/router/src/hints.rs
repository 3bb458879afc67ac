//! Routing hints (§6): `-- route to server <name>` and
//! `-- max_slave_replication_lag=<ms>` comments attached to a statement.
//! The decider walks these as a singly-linked list and ignores anything it
//! doesn't recognise.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    RouteToServer(String),
    MaxSlaveReplicationLag(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintNode {
    pub hint: Hint,
    pub next: Option<Box<HintNode>>,
}

impl HintNode {
    pub fn iter(&self) -> HintIter<'_> {
        HintIter { node: Some(self) }
    }
}

pub struct HintIter<'a> {
    node: Option<&'a HintNode>,
}

impl<'a> Iterator for HintIter<'a> {
    type Item = &'a Hint;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.node.take()?;
        self.node = node.next.as_deref();
        Some(&node.hint)
    }
}

fn parse_one(line: &str) -> Option<Hint> {
    let line = line.trim();
    if let Some(name) = line.strip_prefix("route to server ") {
        return Some(Hint::RouteToServer(name.trim().to_string()));
    }
    if let Some(value) = line.strip_prefix("max_slave_replication_lag=") {
        return value.trim().parse::<u64>().ok().map(Hint::MaxSlaveReplicationLag);
    }
    None
}

/// Scans a statement's trailing `--` comments for hints, building a singly
/// linked list in the order the comments appeared. Lines that aren't
/// recognised hints are silently skipped, per spec.
pub fn parse_hints(statement_text: &[u8]) -> Option<Box<HintNode>> {
    let text = String::from_utf8_lossy(statement_text);
    let mut hints = Vec::new();
    for raw_line in text.lines() {
        let trimmed = raw_line.trim_start();
        let Some(comment) = trimmed.strip_prefix("--") else {
            continue;
        };
        if let Some(hint) = parse_one(comment) {
            hints.push(hint);
        }
    }
    let mut head: Option<Box<HintNode>> = None;
    for hint in hints.into_iter().rev() {
        head = Some(Box::new(HintNode { hint, next: head }));
    }
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_server_and_lag_hints_in_order() {
        let text = b"SELECT 1;\n-- route to server replica2\n-- max_slave_replication_lag=50\n";
        let chain = parse_hints(text).expect("hints present");
        let collected: Vec<_> = chain.iter().cloned().collect();
        assert_eq!(
            collected,
            vec![
                Hint::RouteToServer("replica2".to_string()),
                Hint::MaxSlaveReplicationLag(50),
            ]
        );
    }

    #[test]
    fn ignores_unrecognised_hint_comments() {
        let text = b"SELECT 1; -- some unrelated comment\n";
        assert!(parse_hints(text).is_none());
    }
}
