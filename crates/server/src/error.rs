use outrig_protocol::{ErrorShape, error_codes};

/// Failures surfaced across the coordinator's dispatch boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("plugin \"{0}\" not found")]
    PluginNotFound(String),

    #[error("instance #{0} not found")]
    InstanceNotFound(u64),

    #[error("event id {0} not found")]
    EventNotFound(u64),

    #[error("plugin \"{plugin}\" does not handle phase \"{phase}\"")]
    PhaseNotFound { plugin: String, phase: String },

    #[error("plugin dir {0} not found")]
    PluginDirNotFound(String),

    #[error("invalid config for plugin \"{plugin}\": {reason}")]
    InvalidConfig { plugin: String, reason: String },

    #[error("failed to load plugin module: {0}")]
    Load(String),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("event id {0} timed out")]
    Timeout(u64),

    #[error("worker pool exhausted")]
    Busy,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PluginNotFound(_)
            | Self::InstanceNotFound(_)
            | Self::EventNotFound(_)
            | Self::PhaseNotFound { .. }
            | Self::PluginDirNotFound(_) => error_codes::NOT_FOUND,
            Self::InvalidConfig { .. } => error_codes::INVALID_CONFIG,
            Self::Load(_) => error_codes::LOAD_ERROR,
            Self::Worker(_) => error_codes::WORKER_ERROR,
            Self::Timeout(_) => error_codes::TIMEOUT,
            Self::Busy => error_codes::BUSY,
            Self::Internal(_) => error_codes::INTERNAL,
        }
    }
}

impl From<CoordinatorError> for ErrorShape {
    fn from(err: CoordinatorError) -> Self {
        ErrorShape::new(err.code(), err.to_string())
    }
}

pub type Result<T, E = CoordinatorError> = std::result::Result<T, E>;
