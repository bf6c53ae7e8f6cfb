//! The on-wire frame: a 16-byte content digest, the payload, and a fixed terminator.

use crate::error::{CommsErr, Result};

/// Positive acknowledgement token. Fixed size so the sender reads an exact reply.
pub const ACK: &[u8; 3] = b"ACK";
/// Negative acknowledgement token, same size as [`ACK`].
pub const NAK: &[u8; 3] = b"NAK";
/// Frame terminator marker. Not escaped inside payloads.
pub const TERMINATOR: &[u8; 3] = b"EOF";

/// Size of the md5 content digest prefixing every frame.
pub const DIGEST_SIZE: usize = 16;

/// Encodes `payload` into a frame: `digest || payload || terminator`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let digest = md5::compute(payload);

    let mut frame = Vec::with_capacity(DIGEST_SIZE + payload.len() + TERMINATOR.len());
    frame.extend_from_slice(&digest.0);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(TERMINATOR);
    frame
}

/// Splits the first complete frame off `bytes` and verifies its digest.
///
/// # Arguments
/// * `bytes` - A received byte sequence, possibly holding a partial frame or
///   bytes past the first terminator.
///
/// # Returns
/// The verified payload and the remainder after the terminator.
///
/// # Errors
/// `Incomplete` if no terminator is present, `ChecksumMismatch` if the digest
/// disagrees with the payload (or the frame is too short to carry a digest),
/// and `EmptyPayload` for a verified zero-length payload, which is the
/// deliberate-shutdown sentinel rather than data.
pub fn decode(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    let (body, rest) = split(bytes).ok_or(CommsErr::Incomplete)?;
    let payload = verify(body)?;
    Ok((payload, rest))
}

/// Locates the first terminator, returning the frame body before it and the
/// remainder after it. `None` until a terminator has been read.
pub fn split(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = bytes
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)?;

    let (body, rest) = bytes.split_at(end);
    Some((body, &rest[TERMINATOR.len()..]))
}

/// Checks a frame body (`digest || payload`) against its own digest.
pub fn verify(body: &[u8]) -> Result<&[u8]> {
    if body.len() < DIGEST_SIZE {
        return Err(CommsErr::ChecksumMismatch);
    }

    let (digest, payload) = body.split_at(DIGEST_SIZE);
    if md5::compute(payload).0 != digest {
        return Err(CommsErr::ChecksumMismatch);
    }

    if payload.is_empty() {
        return Err(CommsErr::EmptyPayload);
    }

    Ok(payload)
}
