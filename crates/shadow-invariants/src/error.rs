#[derive(Debug, thiserror::Error)]
pub enum InvariantConfigError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid mandate key: {0}")]
    InvalidKey(String),

    #[error("budget limit must be a non-negative finite number, got {0}")]
    InvalidBudget(f64),
}
