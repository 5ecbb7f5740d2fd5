use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input — the caller's fault (4xx-equivalent).
    Validation(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// The backing store could not be reached (5xx-equivalent). Not retried here.
    Unavailable(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
