use std::io;
use thiserror::Error;

/// Error kinds shared by every component of the agent.
///
/// Each kind maps onto the numeric error code carried on the coprocessor
/// boundary (`ot_code`), so a result can cross that boundary in both
/// directions without losing its meaning.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments")]
    InvalidArgs,

    #[error("parse error")]
    Parse,

    #[error("not found")]
    NotFound,

    #[error("not implemented")]
    NotImplemented,

    #[error("busy")]
    Busy,

    #[error("no buffers")]
    NoBufs,

    #[error("invalid state")]
    InvalidState,

    #[error("duplicated")]
    Duplicated,

    #[error("aborted")]
    Aborted,

    #[error("failed: {0}")]
    Failed(String),

    #[error("os error: {0}")]
    Errno(#[from] io::Error),

    /// A coprocessor error code with no dedicated kind.
    #[error("coprocessor error {0}")]
    Coprocessor(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const OT_ERROR_NONE: u8 = 0;
pub const OT_ERROR_FAILED: u8 = 1;
pub const OT_ERROR_NO_BUFS: u8 = 3;
pub const OT_ERROR_BUSY: u8 = 5;
pub const OT_ERROR_PARSE: u8 = 6;
pub const OT_ERROR_INVALID_ARGS: u8 = 7;
pub const OT_ERROR_ABORT: u8 = 11;
pub const OT_ERROR_NOT_IMPLEMENTED: u8 = 12;
pub const OT_ERROR_INVALID_STATE: u8 = 13;
pub const OT_ERROR_NOT_FOUND: u8 = 23;
pub const OT_ERROR_DUPLICATED: u8 = 24;

impl Error {
    /// Numeric code used when reporting this error to the coprocessor.
    pub fn ot_code(&self) -> u8 {
        match self {
            Error::InvalidArgs => OT_ERROR_INVALID_ARGS,
            Error::Parse => OT_ERROR_PARSE,
            Error::NotFound => OT_ERROR_NOT_FOUND,
            Error::NotImplemented => OT_ERROR_NOT_IMPLEMENTED,
            Error::Busy => OT_ERROR_BUSY,
            Error::NoBufs => OT_ERROR_NO_BUFS,
            Error::InvalidState => OT_ERROR_INVALID_STATE,
            Error::Duplicated => OT_ERROR_DUPLICATED,
            Error::Aborted => OT_ERROR_ABORT,
            Error::Failed(_) | Error::Errno(_) => OT_ERROR_FAILED,
            Error::Coprocessor(code) => *code,
        }
    }
}

/// Code for a whole result, `OT_ERROR_NONE` on success.
pub fn result_to_ot_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => OT_ERROR_NONE,
        Err(e) => e.ot_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_kinds_map_to_their_codes() {
        assert_eq!(Error::InvalidArgs.ot_code(), OT_ERROR_INVALID_ARGS);
        assert_eq!(Error::Parse.ot_code(), OT_ERROR_PARSE);
        assert_eq!(Error::NotFound.ot_code(), OT_ERROR_NOT_FOUND);
        assert_eq!(Error::NotImplemented.ot_code(), OT_ERROR_NOT_IMPLEMENTED);
        assert_eq!(Error::Busy.ot_code(), OT_ERROR_BUSY);
        assert_eq!(Error::NoBufs.ot_code(), OT_ERROR_NO_BUFS);
        assert_eq!(Error::InvalidState.ot_code(), OT_ERROR_INVALID_STATE);
        assert_eq!(Error::Duplicated.ot_code(), OT_ERROR_DUPLICATED);
        assert_eq!(Error::Aborted.ot_code(), OT_ERROR_ABORT);
    }

    #[test]
    fn test_generic_failures_report_failed() {
        assert_eq!(Error::Failed("x".into()).ot_code(), OT_ERROR_FAILED);
        let io = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Error::from(io).ot_code(), OT_ERROR_FAILED);
        assert_eq!(result_to_ot_code(&Ok(())), OT_ERROR_NONE);
    }

    #[test]
    fn test_coprocessor_code_is_preserved() {
        assert_eq!(Error::Coprocessor(28).ot_code(), 28);
        assert_eq!(result_to_ot_code(&Err(Error::Coprocessor(28))), 28);
    }
}
