//! Error types

/// Errors returned to frames requesting injection data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InjectError {
    /// The delayed environment was released or has expired
    #[error("Injection data expired, please reload the tab!")]
    Expired,
}
