use thiserror::Error;

/// Result type for gate setup and serving
pub type Result<T> = std::result::Result<T, GateError>;

/// Top-level error type for bootstrapping and running the gate
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    /// The store could not be reached while starting up
    #[error("Rate limiting failed: {0}")]
    RateLimit(#[from] RateLimitError),
}

/// Token verification failures. Always terminal for the request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token is malformed, unsigned or signed with an unsupported algorithm")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token issuer or audience is not accepted")]
    InvalidIssuer,
}

impl AuthError {
    /// Stable, machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidToken => "InvalidToken",
            AuthError::TokenExpired => "TokenExpired",
            AuthError::InvalidIssuer => "InvalidIssuer",
        }
    }
}

/// Failures of the shared bucket store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The store could not be reached, timed out, or returned garbage.
    /// The payload is for logs only and never reaches the caller.
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Malformed policy sets, key material or configuration files
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    #[error("Missing key material: {0}")]
    MissingKeyMaterial(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
