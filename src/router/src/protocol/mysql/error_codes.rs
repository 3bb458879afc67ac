//! Subset of MySQL server error codes the router needs to synthesize its own
//! ERR packets (e.g. "no suitable backend", "read-only").
//! See: https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_OPTION_PREVENTS_STATEMENT = 1290,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_NO_SUCH_TABLE = 1146,
    ER_LOCK_WAIT_TIMEOUT = 1205,
    ER_QUERY_INTERRUPTED = 1317,
}

impl ErrorKind {
    pub fn sqlstate(&self) -> &'static [u8] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR => b"28000",
            ErrorKind::ER_OPTION_PREVENTS_STATEMENT => b"HY000",
            ErrorKind::ER_UNKNOWN_COM_ERROR => b"08S01",
            ErrorKind::ER_NO_SUCH_TABLE => b"42S02",
            ErrorKind::ER_LOCK_WAIT_TIMEOUT => b"HY000",
            ErrorKind::ER_QUERY_INTERRUPTED => b"70100",
        }
    }
}
