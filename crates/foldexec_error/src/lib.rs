use std::error::Error;
use std::fmt;

/// Result type used throughout the workspace.
pub type Result<T, E = FoldexecError> = std::result::Result<T, E>;

/// An error that can occur anywhere during planning or execution.
#[derive(Debug)]
pub struct FoldexecError {
    inner: Box<FoldexecErrorInner>,
}

#[derive(Debug)]
struct FoldexecErrorInner {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl FoldexecError {
    pub fn new(message: impl Into<String>) -> Self {
        FoldexecError {
            inner: Box::new(FoldexecErrorInner {
                message: message.into(),
                source: None,
            }),
        }
    }

    pub fn with_source(message: impl Into<String>, source: Box<dyn Error + Send + Sync>) -> Self {
        FoldexecError {
            inner: Box::new(FoldexecErrorInner {
                message: message.into(),
                source: Some(source),
            }),
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }
}

impl fmt::Display for FoldexecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.message)?;
        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl Error for FoldexecError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for FoldexecError {
    fn from(value: std::io::Error) -> Self {
        Self::with_source("io error", Box::new(value))
    }
}

/// Add context to the error variant of a result.
pub trait ResultExt<T, E> {
    /// Wrap an error with a static context string.
    fn context(self, msg: &'static str) -> Result<T>;

    /// Wrap an error with a lazily evaluated context string.
    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(FoldexecError::with_source(msg, Box::new(e))),
        }
    }

    fn context_fn(self, f: impl FnOnce() -> String) -> Result<T> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(FoldexecError::with_source(f(), Box::new(e))),
        }
    }
}

/// Convert an option into an error with a message describing the field or
/// value that's missing.
pub trait OptionExt<T> {
    fn required(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, field: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(FoldexecError::new(format!("missing required value: {field}"))),
        }
    }
}

/// Return early with a "not implemented" error.
#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        return Err($crate::FoldexecError::new(format!("not implemented: {msg}")));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_source() {
        let err: Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"))
            .context("failed to flush spill file");
        let err = err.unwrap_err();
        assert_eq!("failed to flush spill file", err.message());
        assert!(err.source().is_some());
    }

    #[test]
    fn required_produces_message() {
        let v: Option<i32> = None;
        let err = v.required("batch file name").unwrap_err();
        assert!(err.message().contains("batch file name"));
    }
}
