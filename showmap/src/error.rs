use std::{fmt, fmt::Formatter, io};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The shared memory segment could not be created or attached
    SharedMemory(String),
    /// The fork server handshake was not completed. Usually the target lacks the instrumentation.
    Protocol(String),
    /// The handshake completed but not a single tuple was recorded
    NoCoverage,
    /// Invalid settings, detected before anything is set up
    Config(String),
    IO(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::SharedMemory(err) => write!(f, "shared memory failure: {}", err),
            Error::Protocol(err) => write!(f, "No instrumentation detected ({})", err),
            Error::NoCoverage => write!(f, "No instrumentation data found"),
            Error::Config(err) => write!(f, "invalid configuration: {}", err),
            Error::IO(err) => write!(f, "error in io: {}", err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::IO(err.desc().to_string())
    }
}
