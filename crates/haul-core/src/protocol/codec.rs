//! Frame codec: a big-endian `u16` byte count followed by a JSON object.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

use super::message::{ContentFileRequest, ContentFileResponse};

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame payload of {0} bytes exceeds 65535")]
    FrameTooLarge(usize),
    #[error("frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// A message that can travel in a frame.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Repairs fields after decoding. Most messages need nothing.
    fn sanitize(&mut self) {}
}

impl WireMessage for ContentFileRequest {
    fn sanitize(&mut self) {
        ContentFileRequest::sanitize(self);
    }
}

impl WireMessage for ContentFileResponse {}

/// Encodes `msg` into one complete frame.
pub fn encode<M: WireMessage>(msg: &M) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one complete frame, sanitizing the result.
pub fn decode<M: WireMessage>(frame: &[u8]) -> Result<M, ProtocolError> {
    if frame.len() < 2 {
        return Err(ProtocolError::LengthMismatch {
            declared: 0,
            actual: frame.len(),
        });
    }
    let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let payload = &frame[2..];
    if payload.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    let mut msg: M = serde_json::from_slice(payload)?;
    msg.sanitize();
    Ok(msg)
}

/// Reads exactly one frame (prefix included) from `r`.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    r.read_exact(&mut prefix)?;
    let len = u16::from_be_bytes(prefix) as usize;
    let mut frame = vec![0u8; len + 2];
    frame[..2].copy_from_slice(&prefix);
    r.read_exact(&mut frame[2..])?;
    Ok(frame)
}

/// Writes a frame produced by [`encode`] and flushes.
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
    w.write_all(frame)?;
    w.flush()
}
