/// Shared error type used across all ToolGate crates.
///
/// Policy denials, rate-limit rejections, and remote tool errors are *not*
/// errors — they are structured results carried back to the caller. This
/// enum covers the failure sites that abort a call.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("remote: {0}")]
    Remote(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("storage: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;
