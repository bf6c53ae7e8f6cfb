//! The layer-computation interface consumed by the stage protocol.
//!
//! A segment is a locally held run of model layers between two split
//! boundaries. Payloads are opaque serialized numeric arrays; the protocol
//! never interprets them, only the segment does. Segments retain whatever
//! intermediate state their own gradients need across one forward/backward
//! cycle.

use crate::error::{Result, SplitErr};

/// One locally computed model segment.
pub trait SegmentCompute: Send {
    /// Maps a boundary activation to the next boundary activation.
    fn run_forward(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    /// Maps the gradient at this segment's output to the gradient at its
    /// input.
    fn run_backward(&mut self, grad: &[u8]) -> Result<Vec<u8>>;
}

/// Views tensor-like bytes as f32 lanes.
pub fn lanes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % size_of::<f32>() != 0 {
        return Err(SplitErr::OddTensorLength { len: bytes.len() });
    }

    Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// Serializes f32 lanes back into tensor-like bytes.
pub fn bytes(lanes: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(lanes).to_vec()
}

/// Passes activations and gradients through unchanged. Stands in for a
/// segment whose real computation lives on the other side of the boundary.
#[derive(Debug, Default)]
pub struct EchoSegment;

impl SegmentCompute for EchoSegment {
    fn run_forward(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn run_backward(&mut self, grad: &[u8]) -> Result<Vec<u8>> {
        Ok(grad.to_vec())
    }
}

/// Elementwise `y = scale * x + shift`.
///
/// Linear, so the backward map is a plain rescale and nothing needs to be
/// retained between the passes.
#[derive(Debug, Clone, Copy)]
pub struct AffineSegment {
    pub scale: f32,
    pub shift: f32,
}

impl AffineSegment {
    pub fn new(scale: f32, shift: f32) -> Self {
        Self { scale, shift }
    }
}

impl SegmentCompute for AffineSegment {
    fn run_forward(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut x = lanes(input)?;
        for v in &mut x {
            *v = self.scale * *v + self.shift;
        }
        Ok(bytes(&x))
    }

    fn run_backward(&mut self, grad: &[u8]) -> Result<Vec<u8>> {
        let mut g = lanes(grad)?;
        for v in &mut g {
            *v *= self.scale;
        }
        Ok(bytes(&g))
    }
}

/// Runs inner segments in sequence: forward front-to-back, backward
/// back-to-front.
pub struct Pipeline {
    inner: Vec<Box<dyn SegmentCompute>>,
}

impl Pipeline {
    pub fn new(inner: Vec<Box<dyn SegmentCompute>>) -> Self {
        Self { inner }
    }
}

impl SegmentCompute for Pipeline {
    fn run_forward(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut x = input.to_vec();
        for segment in &mut self.inner {
            x = segment.run_forward(&x)?;
        }
        Ok(x)
    }

    fn run_backward(&mut self, grad: &[u8]) -> Result<Vec<u8>> {
        let mut g = grad.to_vec();
        for segment in self.inner.iter_mut().rev() {
            g = segment.run_backward(&g)?;
        }
        Ok(g)
    }
}
