/// Category of an endpoint or probe error. Lets the engine decide
/// whether a failure aborts the scenario or is absorbed into metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Endpoint unreachable or session lost: fatal at scenario start.
    Connection,
    /// Operation did not complete in time.
    Timeout,
    /// Topic or filter rejected before reaching the broker.
    Topic,
    /// Broker or tool refused a single publish.
    Rejected,
    /// Output could not be parsed.
    Format,
    /// Local I/O (process spawn, pipes).
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Connection => f.write_str("connection"),
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::Topic => f.write_str("topic"),
            ErrorKind::Rejected => f.write_str("rejected"),
            ErrorKind::Format => f.write_str("format"),
            ErrorKind::Io => f.write_str("io"),
        }
    }
}

/// Unified error type for adapter and probe trait methods.
///
/// Carries an `ErrorKind` for categorization and a human-readable message.
/// Adapters never retry internally; the kind tells the caller what happened.
#[derive(Clone)]
pub struct BenchError {
    kind: ErrorKind,
    message: String,
}

impl BenchError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    /// Endpoint unreachable (refused, reset, no CONNACK).
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    /// Malformed topic name or filter.
    pub fn topic(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Topic, msg)
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, msg)
    }

    pub fn format_err(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Debug for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BenchError {}

impl From<std::io::Error> for BenchError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => ErrorKind::Connection,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Self { kind, message: e.to_string() }
    }
}

impl From<serde_json::Error> for BenchError {
    fn from(e: serde_json::Error) -> Self {
        Self { kind: ErrorKind::Format, message: e.to_string() }
    }
}

impl From<std::str::Utf8Error> for BenchError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self { kind: ErrorKind::Format, message: e.to_string() }
    }
}
