use serde::Serialize;

use crate::engine::migrate::StepId;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
///
/// Serializes as `{ error, kind }` for operator tooling and the view layer.
/// `NotFound` and `Forbidden` serialize identically so routing denials never
/// reveal whether a scenario exists.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid transition for scenario '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Protected scenario: {0}")]
    Protected(String),

    #[error("Scenario in use: {0}")]
    InUse(String),

    #[error("Scenario '{scenario}' unreachable: {cause}")]
    Unreachable { scenario: String, cause: String },

    #[error("Migration step {step} failed on scenario '{scenario}': {cause}")]
    MigrationStepFailed {
        scenario: String,
        step: StepId,
        cause: String,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind exposed outside the process.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::AlreadyExists(_) => "already_exists",
            // Routing denials share one external code.
            AppError::NotFound(_) | AppError::Forbidden(_) => "access_denied",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Conflict(_) => "conflict",
            AppError::Protected(_) => "protected",
            AppError::InUse(_) => "in_use",
            AppError::Unreachable { .. } => "unreachable",
            AppError::MigrationStepFailed { .. } => "migration_step_failed",
            AppError::Cancelled(_) => "cancelled",
            AppError::Validation(_) => "validation",
            AppError::Config(_) | AppError::ConfigParse(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Internal(_) => "internal",
        }
    }

    /// Internal reason used for telemetry. Distinguishes `NotFound` from
    /// `Forbidden`, unlike [`AppError::kind`].
    pub fn reason(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            other => other.kind(),
        }
    }

    fn external_message(&self) -> String {
        match self {
            AppError::NotFound(_) | AppError::Forbidden(_) => "Scenario not available".into(),
            other => other.to_string(),
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.external_message())?;
        s.serialize_field("kind", self.kind())?;
        s.end()
    }
}
