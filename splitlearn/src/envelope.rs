//! The application layer message crossing a split boundary: a payload tagged
//! with its stage, plus the control plane used during session bootstrap.
//!
//! On the wire an envelope is a 4-byte big-endian kind header followed by the
//! body. The channel below treats the whole thing as an opaque payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitErr};

type Kind = u32;
const KIND_SIZE: usize = size_of::<Kind>();

const NOTICE_K: Kind = 0;
const CONTROL_K: Kind = 1;
const FORWARD_K: Kind = 2;
const BACKWARD_K: Kind = 3;

/// Marks whether an exchanged payload belongs to the forward or the backward
/// pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Forward,
    Backward,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Forward => write!(f, "forward"),
            Stage::Backward => write!(f, "backward"),
        }
    }
}

/// Wire-level bootstrap specification for a split session.
///
/// This type is exchanged over the network before the first training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Number of split boundaries, i.e. remote exchanges per forward pass.
    pub boundaries: usize,
}

/// The command for the `Control` variant of the `Envelope` enum.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Connect(SessionSpec),
    Accept,
}

/// One message crossing the split boundary.
#[derive(Debug, PartialEq)]
pub enum Envelope {
    /// Free text: peer error reports and the "not ready" placeholder.
    Notice(String),
    Control(Command),
    Tensor { stage: Stage, bytes: Vec<u8> },
}

/// Encodes a tensor envelope without taking ownership of the bytes.
pub fn encode_tensor(stage: Stage, data: &[u8]) -> Vec<u8> {
    let kind = match stage {
        Stage::Forward => FORWARD_K,
        Stage::Backward => BACKWARD_K,
    };

    let mut buf = Vec::with_capacity(KIND_SIZE + data.len());
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

impl Envelope {
    /// Serializes the envelope into channel-ready bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Envelope::Notice(text) => {
                let mut buf = Vec::with_capacity(KIND_SIZE + text.len());
                buf.extend_from_slice(&NOTICE_K.to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                buf
            }
            Envelope::Control(cmd) => {
                let mut buf = Vec::new();
                buf.extend_from_slice(&CONTROL_K.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not
                //         implemented by hand. Nor has a non string-key map
                //         inside.
                serde_json::to_writer(&mut buf, cmd).unwrap();
                buf
            }
            Envelope::Tensor { stage, bytes } => encode_tensor(*stage, bytes),
        }
    }

    /// Deserializes an envelope from received channel bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < KIND_SIZE {
            return Err(SplitErr::UnexpectedEnvelope {
                got: "truncated header",
                expected: "a 4-byte kind header",
            });
        }

        let (kind_buf, body) = buf.split_at(KIND_SIZE);

        // SAFETY: We splitted the buffer to be of size `KIND_SIZE` just above.
        let kind = Kind::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            NOTICE_K => Ok(Self::Notice(str::from_utf8(body)?.to_string())),
            CONTROL_K => Ok(Self::Control(serde_json::from_slice(body)?)),
            FORWARD_K => Ok(Self::Tensor {
                stage: Stage::Forward,
                bytes: body.to_vec(),
            }),
            BACKWARD_K => Ok(Self::Tensor {
                stage: Stage::Backward,
                bytes: body.to_vec(),
            }),
            kind => Err(SplitErr::InvalidKind { kind }),
        }
    }

    /// Short name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::Notice(_) => "notice",
            Envelope::Control(_) => "control",
            Envelope::Tensor {
                stage: Stage::Forward,
                ..
            } => "forward tensor",
            Envelope::Tensor {
                stage: Stage::Backward,
                ..
            } => "backward tensor",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrip_keeps_stage_and_bytes() {
        let envelope = Envelope::Tensor {
            stage: Stage::Backward,
            bytes: vec![1, 2, 3, 255],
        };

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn control_roundtrip() {
        let envelope = Envelope::Control(Command::Connect(SessionSpec { boundaries: 2 }));
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn notice_roundtrip() {
        let envelope = Envelope::Notice("not ready".to_string());
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = 9u32.to_be_bytes().to_vec();
        buf.push(0);

        assert!(matches!(
            Envelope::decode(&buf),
            Err(SplitErr::InvalidKind { kind: 9 })
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(Envelope::decode(&[0, 1]).is_err());
    }

    #[test]
    fn encode_tensor_matches_the_enum_encoding() {
        let data = [7u8, 8, 9];
        let via_enum = Envelope::Tensor {
            stage: Stage::Forward,
            bytes: data.to_vec(),
        }
        .encode();

        assert_eq!(encode_tensor(Stage::Forward, &data), via_enum);
    }
}
