use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared by every simtools component.
///
/// The variants follow the orchestration error classes: configuration
/// problems are fatal for the caller, backend errors may be transient and
/// are retried on the next tick, analysis and render errors stay isolated
/// to the job or analyzer that produced them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend error ({location}): {message}")]
    Backend {
        location: String,
        message: String,
        transient: bool,
    },

    #[error("job store error: {0}")]
    Store(String),

    #[error("lock unavailable: {0}")]
    Lock(String),

    #[error("analysis failed for simulation {sim_id}: {message}")]
    Analysis { sim_id: String, message: String },

    #[error("render failed for analyzer {analyzer}: {message}")]
    Render { analyzer: String, message: String },

    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("ambiguous selection '{query}': {} candidates ({})", candidates.len(), candidates.join(", "))]
    Ambiguous {
        query: String,
        candidates: Vec<String>,
    },

    #[error("invalid status transition for {sim_id}: {from} -> {to}")]
    InvalidTransition {
        sim_id: String,
        from: String,
        to: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn transient(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            location: location.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn backend(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            location: location.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// True for failures that should be retried on a later tick rather than
    /// surfaced to the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }

    /// Process exit code used by the command line surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 2,
            Self::Ambiguous { .. } => 3,
            Self::Backend { .. } => 4,
            Self::Config(_) => 5,
            _ => 1,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Backend { .. } => "backend_error",
            Self::Store(_) => "store_error",
            Self::Lock(_) => "lock_unavailable",
            Self::Analysis { .. } => "analysis_error",
            Self::Render { .. } => "render_error",
            Self::NotFound(_) => "experiment_not_found",
            Self::Ambiguous { .. } => "ambiguous_selection",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_selection_failures() {
        assert_eq!(Error::NotFound("x".into()).exit_code(), 2);
        let amb = Error::Ambiguous {
            query: "exp".into(),
            candidates: vec!["a".into(), "b".into()],
        };
        assert_eq!(amb.exit_code(), 3);
        assert!(amb.to_string().contains("2 candidates (a, b)"));
        assert_eq!(Error::transient("remote", "timeout").exit_code(), 4);
        assert_eq!(Error::Config("missing block".into()).exit_code(), 5);
    }

    #[test]
    fn only_transient_backend_errors_are_retryable() {
        assert!(Error::transient("remote", "503").is_transient());
        assert!(!Error::backend("remote", "401").is_transient());
        assert!(!Error::Store("locked".into()).is_transient());
    }
}
