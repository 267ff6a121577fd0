use thiserror::Error;

/// cdbox error taxonomy.
///
/// Every variant maps onto one process exit code through [`BoxError::exit_code`].
#[derive(Error, Debug)]
pub enum BoxError {
    /// Malformed flag, bad reference or conflicting options
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown container, image, volume, network or namespace
    #[error("no such {kind}: {id}")]
    NotFound { kind: String, id: String },

    /// A token matched more than one object
    #[error("multiple IDs found with provided prefix \"{query}\" ({count} {kind}s match)")]
    Ambiguous {
        kind: String,
        query: String,
        count: usize,
    },

    /// Name collision on create
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Operation requires a different state
    #[error("{0}")]
    Precondition(String),

    /// Failure from the runtime, the network plugin or the image service
    #[error("{stage}: {message}")]
    Runtime { stage: String, message: String },

    /// The command's root context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// A foreground container (or exec'd process) exited non-zero
    #[error("container exited with code {0}")]
    ContainerExit(i32),

    /// The container command could not be executed (126) or found (127)
    #[error("{message}")]
    CommandFailed { code: i32, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),

    /// Some targets of a multi-target command failed; each failure has
    /// already been printed
    #[error("{0} of the given targets failed")]
    Reported(usize),
}

impl BoxError {
    /// Build a [`BoxError::NotFound`].
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// Build a [`BoxError::Runtime`] with a stage prefix.
    pub fn runtime(stage: &str, message: impl std::fmt::Display) -> Self {
        Self::Runtime {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    /// Build a [`BoxError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 125,
            Self::Cancelled => 130,
            Self::ContainerExit(code) => *code,
            Self::CommandFailed { code, .. } => *code,
            _ => 1,
        }
    }

    /// Whether this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BoxError {
    fn from(err: serde_yaml::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for BoxError {
    fn from(err: toml::de::Error) -> Self {
        BoxError::SerializationError(err.to_string())
    }
}

/// Result type alias for cdbox operations
pub type Result<T> = std::result::Result<T, BoxError>;
