

//! Error type and result aliases used throughout this crate.

use std::convert::TryFrom;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;
pub type UnitResult = Result<()>;

pub use std::io::Error as IoError;
pub use std::io::Result as IoResult;


/// All the ways serving an image can fail.
///
/// Running out of space in a response buffer is not an error:
/// the data-bin writer records it as state and the server finishes
/// the chunk with the appropriate end-of-response code.
#[derive(Debug)]
pub enum Error {

    /// The JPIP request parameters are malformed.
    BadRequest(String),

    /// The image file cannot be indexed: broken box structure or
    /// marker stream, missing PLT markers, missing EOC.
    BadImage(String),

    /// The request referenced a channel id that is not open.
    UnknownChannel(String),

    /// The image is valid but uses a feature this server does not
    /// implement, such as the PCRL or CPRL progression orders.
    NotSupported(String),

    /// This error can also occur when reading invalid files,
    /// where the number of bytes to read does not match the file length.
    Io(IoError),

    /// An internal invariant was violated. The session must be dropped.
    Internal(String),
}


impl Error {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    pub fn bad_image(message: impl Into<String>) -> Self {
        Error::BadImage(message.into())
    }

    pub fn unknown_channel(message: impl Into<String>) -> Self {
        Error::UnknownChannel(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::NotSupported(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}


/// Enable using the `?` operator on io::Result
impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Error::Io(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRequest(message) => write!(formatter, "bad request: {}", message),
            Error::BadImage(message) => write!(formatter, "bad image: {}", message),
            Error::UnknownChannel(message) => write!(formatter, "unknown channel: {}", message),
            Error::NotSupported(message) => write!(formatter, "not supported: {}", message),
            Error::Io(error) => write!(formatter, "io error: {}", error),
            Error::Internal(message) => write!(formatter, "internal error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(error) => Some(error),
            _ => None,
        }
    }
}


/// Panics on 16-bit machines, where a packet index could exceed the address space.
#[inline]
pub fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).expect("(u64 as usize) overflowed")
}

#[inline]
pub fn usize_to_u64(value: usize) -> u64 {
    value as u64
}
