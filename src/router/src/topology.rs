//! Cluster topology snapshot.
//!
//! The monitor (an external collaborator, out of scope for this core) is the
//! only writer; the router only ever reads an atomically-swapped snapshot,
//! published as an `Arc<Topology>` behind a `parking_lot::RwLock` so a swap
//! never blocks an in-flight reader.

use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Replica,
    Relay,
    Down,
}

/// One configured server in the cluster, as seen by the monitor.
#[derive(Debug, Clone)]
pub struct Server {
    pub name: String,
    pub addr: String,
    pub role: ServerRole,
    /// Replication lag behind the primary, in milliseconds. `None` when the
    /// role is `Primary` or the monitor has not yet produced a measurement.
    pub lag_ms: Option<u64>,
}

impl Server {
    pub fn is_reachable(&self) -> bool {
        !matches!(self.role, ServerRole::Down)
    }
}

/// Snapshot of every server in the cluster, published by the monitor.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    servers: Vec<Server>,
}

impl Topology {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn primary(&self) -> Option<&Server> {
        self.servers.iter().find(|s| s.role == ServerRole::Primary)
    }

    pub fn by_name(&self, name: &str) -> Option<&Server> {
        self.servers
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// Cross-session, read-mostly handle to the current topology. Cheap to
/// clone; every session holds one. Writes come only from the monitor task.
#[derive(Clone, Default)]
pub struct TopologyHandle(Arc<RwLock<Arc<Topology>>>);

impl TopologyHandle {
    pub fn new(initial: Topology) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(initial))))
    }

    pub fn current(&self) -> Arc<Topology> {
        self.0.read().clone()
    }

    pub fn swap(&self, next: Topology) {
        *self.0.write() = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srv(name: &str, role: ServerRole, lag: Option<u64>) -> Server {
        Server {
            name: name.to_string(),
            addr: format!("{name}:3306"),
            role,
            lag_ms: lag,
        }
    }

    #[test]
    fn finds_primary_and_named_server() {
        let topo = Topology::new(vec![
            srv("m1", ServerRole::Primary, None),
            srv("r1", ServerRole::Replica, Some(5)),
        ]);
        assert_eq!(topo.primary().unwrap().name, "m1");
        assert_eq!(topo.by_name("R1").unwrap().name, "r1");
    }

    #[test]
    fn handle_swap_is_visible_to_existing_clones() {
        let handle = TopologyHandle::new(Topology::new(vec![srv("m1", ServerRole::Primary, None)]));
        let clone = handle.clone();
        handle.swap(Topology::new(vec![srv("m2", ServerRole::Primary, None)]));
        assert_eq!(clone.current().primary().unwrap().name, "m2");
    }
}
