use std::{error::Error, fmt, io, str::Utf8Error};

use comms::CommsErr;

use crate::envelope::Stage;

/// The split protocol's result type.
pub type Result<T> = std::result::Result<T, SplitErr>;

/// Stage protocol and adapter failures.
#[derive(Debug)]
pub enum SplitErr {
    Comms(CommsErr),
    /// Protocol-ordering violation detected at a cycle boundary. Fatal for
    /// the step: continuing would corrupt subsequent frames.
    StaleState {
        op: &'static str,
        retained: usize,
    },
    UnexpectedEnvelope {
        got: &'static str,
        expected: &'static str,
    },
    UnexpectedStage {
        got: Stage,
        expected: Stage,
    },
    GradientLengthMismatch {
        boundary: usize,
        got: usize,
        expected: usize,
    },
    /// The peer's split layout does not pair with ours.
    SessionMismatch {
        got: usize,
        expected: usize,
    },
    /// The peer reported an error in place of a payload.
    PeerNotice(String),
    /// A tensor payload is not a whole number of f32 lanes.
    OddTensorLength {
        len: usize,
    },
    /// A client was built with no local segments to run.
    NoSegments,
    InvalidKind {
        kind: u32,
    },
    Json(serde_json::Error),
    Utf8(Utf8Error),
}

impl fmt::Display for SplitErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitErr::Comms(e) => write!(f, "transport error: {e}"),
            SplitErr::StaleState { op, retained } => {
                write!(f, "stale protocol state at {op}: {retained} retained activations")
            }
            SplitErr::UnexpectedEnvelope { got, expected } => {
                write!(f, "unexpected envelope: got {got}, expected {expected}")
            }
            SplitErr::UnexpectedStage { got, expected } => {
                write!(f, "unexpected stage: got {got}, expected {expected}")
            }
            SplitErr::GradientLengthMismatch {
                boundary,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch at boundary {boundary}: got {got}, expected {expected}"
            ),
            SplitErr::SessionMismatch { got, expected } => {
                write!(f, "session mismatch: peer announced {got} boundaries, this side holds {expected}")
            }
            SplitErr::PeerNotice(text) => write!(f, "peer reported: {text}"),
            SplitErr::OddTensorLength { len } => {
                write!(f, "tensor payload of {len} bytes is not a whole number of f32 lanes")
            }
            SplitErr::NoSegments => write!(f, "a split client needs at least one local segment"),
            SplitErr::InvalidKind { kind } => write!(f, "invalid envelope kind {kind}"),
            SplitErr::Json(e) => write!(f, "control body error: {e}"),
            SplitErr::Utf8(e) => write!(f, "notice body is not utf-8: {e}"),
        }
    }
}

impl Error for SplitErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SplitErr::Comms(e) => Some(e),
            SplitErr::Json(e) => Some(e),
            SplitErr::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommsErr> for SplitErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<serde_json::Error> for SplitErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<Utf8Error> for SplitErr {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SplitErr> for io::Error {
    fn from(value: SplitErr) -> Self {
        match value {
            SplitErr::Comms(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
