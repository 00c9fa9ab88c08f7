use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout occurred during {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] serde_yaml::Error),

    #[error("Invalid target format: {0}")]
    InvalidTarget(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Error evaluating DSL: {0}")]
    Evaluation(String),

    #[error("Template: {rule_id}: required option(s) missing: {}", .options.join(", "))]
    MissingRequiredOption {
        rule_id: String,
        options: Vec<String>,
    },

    #[error("Unsupported matchers-condition: {0}")]
    UnsupportedCondition(String),

    #[error("Module error: {0}")]
    Module(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ScanError {
    /// Errors that mean the operator supplied invalid input up front; the run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::MissingRequiredOption { .. })
    }
}

impl From<native_tls::Error> for ScanError {
    fn from(err: native_tls::Error) -> Self {
        ScanError::Tls(err.to_string())
    }
}
