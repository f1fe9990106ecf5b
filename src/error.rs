#[cfg(feature = "backtrace")]
use backtrace::Backtrace;
use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    reason: ErrorReason,
    #[cfg(feature = "backtrace")]
    bt: Backtrace,
}

impl AppError {
    pub(crate) fn new(reason: ErrorReason) -> Self {
        Self {
            reason,
            #[cfg(feature = "backtrace")]
            bt: Backtrace::new(),
        }
    }

    pub fn reason(&self) -> &ErrorReason {
        &self.reason
    }

    #[cfg(feature = "backtrace")]
    pub fn backtrace(&self) -> &Backtrace {
        &self.bt
    }
}

impl<E> From<E> for AppError
where
    E: Into<ErrorReason>,
{
    fn from(reason: E) -> Self {
        Self::new(reason.into())
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", &self.reason)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.reason.source()
    }
}

#[derive(Debug, Error)]
pub enum ErrorReason {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("malformed certificate store file")]
    Json(#[from] serde_json::Error),
    #[error("unsupported certificate store version {0}")]
    UnsupportedVersion(u32),
    #[error("refusing to write {0} before it was loaded")]
    NotLoaded(PathBuf),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("the store was dropped before the operation completed")]
    Abandoned,
}
