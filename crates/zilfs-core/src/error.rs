use thiserror::Error;

pub type ZilResult<T> = Result<T, ZilError>;

/// Error taxonomy shared by every zilfs crate.
///
/// `Auth` deliberately carries no detail: a wrong passphrase and a
/// tampered container must be indistinguishable to the caller.
#[derive(Debug, Error)]
pub enum ZilError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("authentication failed")]
    Auth,

    #[error("format error: {0}")]
    Format(String),

    #[error("unsupported container version {found} (max supported {max})")]
    Version { found: u16, max: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("entropy source unavailable: {0}")]
    EntropyFailure(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ZilError {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        ZilError::BadArgument(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        ZilError::Format(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ZilError::NotFound(what.into())
    }

    /// Process exit code for the `zil` binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZilError::BadArgument(_) => 2,
            ZilError::NotFound(_) => 3,
            ZilError::Auth => 4,
            ZilError::Format(_) => 5,
            ZilError::Version { .. } => 6,
            ZilError::Busy(_) => 7,
            ZilError::Io(_) => 8,
            ZilError::Cancelled
            | ZilError::EntropyFailure(_)
            | ZilError::RateLimited(_)
            | ZilError::Config(_)
            | ZilError::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        assert_eq!(ZilError::bad_argument("x").exit_code(), 2);
        assert_eq!(ZilError::not_found("a/b").exit_code(), 3);
        assert_eq!(ZilError::Auth.exit_code(), 4);
        assert_eq!(ZilError::format("short").exit_code(), 5);
        assert_eq!(ZilError::Version { found: 9, max: 1 }.exit_code(), 6);
        assert_eq!(ZilError::Busy("locked".into()).exit_code(), 7);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(ZilError::from(io).exit_code(), 8);
        assert_eq!(ZilError::Cancelled.exit_code(), 1);
        assert_eq!(ZilError::RateLimited("k".into()).exit_code(), 1);
    }

    #[test]
    fn auth_message_has_no_detail() {
        assert_eq!(ZilError::Auth.to_string(), "authentication failed");
    }
}
