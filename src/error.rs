use std::io;

/// Central error type for the ravel core engine.
#[derive(Debug)]
pub enum RavelError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// A setup-fatal failure: the server cannot start.
    Setup(&'static str, io::Error),
}

impl std::fmt::Display for RavelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RavelError::Io(e) => write!(f, "I/O error: {}", e),
            RavelError::Setup(what, e) => write!(f, "failed to {}: {}", what, e),
        }
    }
}

impl std::error::Error for RavelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RavelError::Io(e) => Some(e),
            RavelError::Setup(_, e) => Some(e),
        }
    }
}

impl From<io::Error> for RavelError {
    fn from(e: io::Error) -> Self {
        RavelError::Io(e)
    }
}

pub type RavelResult<T> = Result<T, RavelError>;
