use std::fmt;

/// Stable error codes surfaced to callers outside the core (§6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    CorruptedChunk,
    NotFound,
    InvalidArgument,
    Cancelled,
    AlreadyFinalized,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::Io => "IO_ERROR",
            ErrorCode::CorruptedChunk => "CORRUPTED_CHUNK",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::AlreadyFinalized => "ALREADY_FINALIZED",
            ErrorCode::Unknown => "UNKNOWN",
        })
    }
}

/// Typed error for the operations callers need to branch on by kind.
///
/// Internal plumbing still uses `anyhow::Error` throughout (see every
/// other module); this type exists only at the handful of boundary
/// operations listed in §6/§7 where the *kind* of failure, not just its
/// message, determines what the caller does next (retry, skip, abort).
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn corrupted_chunk(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CorruptedChunk, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn already_finalized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyFinalized, message)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::io(err.to_string())
    }
}

/// Converts an internal `anyhow::Error` into a typed boundary error.
///
/// Internal plumbing tags the handful of `bail!`/`format_err!` sites whose
/// kind matters to callers with a leading `[CODE]` (e.g. `[NOT_FOUND] chunk
/// ... not found`); this recovers that code. Untagged messages — the
/// common case, plain I/O or SQL failures with no special handling — default
/// to `Io`, since nearly all of them are exactly that.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        let code = extract_code(&message).unwrap_or(ErrorCode::Io);
        Self { code, message }
    }
}

fn extract_code(message: &str) -> Option<ErrorCode> {
    let rest = message.strip_prefix('[')?;
    let (tag, _) = rest.split_once(']')?;
    Some(match tag {
        "IO_ERROR" => ErrorCode::Io,
        "CORRUPTED_CHUNK" => ErrorCode::CorruptedChunk,
        "NOT_FOUND" => ErrorCode::NotFound,
        "INVALID_ARGUMENT" => ErrorCode::InvalidArgument,
        "CANCELLED" => ErrorCode::Cancelled,
        "ALREADY_FINALIZED" => ErrorCode::AlreadyFinalized,
        _ => return None,
    })
}
