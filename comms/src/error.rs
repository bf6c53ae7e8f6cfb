use std::{error::Error, fmt, io};

/// The comms module's result type.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// Transport and rendezvous failures.
#[derive(Debug)]
pub enum CommsErr {
    Io(io::Error),
    /// A frame arrived whose digest does not match its payload.
    ChecksumMismatch,
    /// The supplied bytes contain no complete frame yet.
    Incomplete,
    /// The peer sent the empty-payload shutdown sentinel.
    EmptyPayload,
    /// The send retry ceiling was hit without a positive acknowledgement.
    SendExhausted {
        attempts: usize,
    },
    /// The receive retry ceiling was hit without a valid frame.
    ReceiveExhausted {
        attempts: usize,
    },
    /// The reconnection bound was hit while re-establishing the connection.
    ReconnectExhausted {
        attempts: usize,
    },
    /// The other side of the rendezvous pair hung up.
    Closed,
}

impl fmt::Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::Io(e) => write!(f, "io error: {e}"),
            CommsErr::ChecksumMismatch => write!(f, "frame digest does not match payload"),
            CommsErr::Incomplete => write!(f, "no complete frame in buffer"),
            CommsErr::EmptyPayload => write!(f, "peer sent the empty-payload shutdown sentinel"),
            CommsErr::SendExhausted { attempts } => {
                write!(f, "send gave up after {attempts} unacknowledged attempts")
            }
            CommsErr::ReceiveExhausted { attempts } => {
                write!(f, "receive gave up after {attempts} failed attempts")
            }
            CommsErr::ReconnectExhausted { attempts } => {
                write!(f, "gave up re-establishing the connection after {attempts} attempts")
            }
            CommsErr::Closed => write!(f, "rendezvous peer hung up"),
        }
    }
}

impl Error for CommsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommsErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommsErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CommsErr> for io::Error {
    fn from(value: CommsErr) -> Self {
        match value {
            CommsErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
