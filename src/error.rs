use thiserror::Error;

/// Engine error taxonomy.
///
/// `Conflict` and `Parse` are normally swallowed into the state machine
/// (the unit goes back to `pending` or on to `failed`); `Upstream` is logged
/// and left for the medic; `Internal` is fatal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("workflow spec error: {0}")]
    Spec(String),

    #[error("cron gateway error: {0}")]
    Upstream(String),

    #[error("output parse error: {0}")]
    Parse(String),

    #[error("retry budget exhausted: {0}")]
    Exhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error must abort the process rather than be folded into
    /// the state machine.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::Database(_))
    }
}
