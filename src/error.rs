//! Process-boundary error type.
//!
//! Everything below `main` uses `rama_error::BoxError` (optionally enriched
//! via `ErrorContext`/`ErrorExt`). This type exists only to let a handful of
//! fatal startup failures (listener bind failure) choose their own process
//! exit code, the same shape as `rama-cli`'s own `ErrorWithExitCode`.

use rama_error::BoxError;

#[derive(Debug)]
pub struct ErrorWithExitCode {
    code: i32,
    error: BoxError,
}

impl ErrorWithExitCode {
    pub fn new(code: i32, error: impl Into<BoxError>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.code
    }
}

impl From<BoxError> for ErrorWithExitCode {
    fn from(error: BoxError) -> Self {
        Self { code: 1, error }
    }
}

impl std::fmt::Display for ErrorWithExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.error)
    }
}

impl std::error::Error for ErrorWithExitCode {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}
