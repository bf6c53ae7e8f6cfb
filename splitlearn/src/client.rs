//! The client side of a split model: the remote layer adapter a training
//! loop invokes exactly as it would invoke a local layer.

use comms::ReliableChannel;
use log::{debug, info, warn};

use crate::{
    envelope::{self, Command, Envelope, SessionSpec, Stage},
    error::{Result, SplitErr},
    segment::SegmentCompute,
    stage::{ExchangeState, StageTracker},
};

/// Drives the staged exchange for the side holding the first model segment.
///
/// `forward` and `backward` look like local layer calls to the surrounding
/// training loop; between consecutive local segments each boundary activation
/// crosses the wire and blocks for the peer's reply.
pub struct SplitClient {
    channel: ReliableChannel,
    segments: Vec<Box<dyn SegmentCompute>>,
    /// Boundary activations of the cycle in flight, forward order.
    retained: Vec<Vec<u8>>,
    tracker: StageTracker,
}

impl SplitClient {
    /// Performs the session handshake over an established channel.
    ///
    /// # Args
    /// * `channel` - The connection to the serving peer.
    /// * `segments` - The locally held model segments, in model order.
    ///
    /// # Errors
    /// `NoSegments` without at least one local segment, `PeerNotice` if the
    /// peer refuses the announced split layout.
    pub fn connect(
        mut channel: ReliableChannel,
        segments: Vec<Box<dyn SegmentCompute>>,
    ) -> Result<Self> {
        if segments.is_empty() {
            return Err(SplitErr::NoSegments);
        }

        let spec = SessionSpec {
            boundaries: segments.len() - 1,
        };

        info!(boundaries = spec.boundaries; "announcing split session");
        channel.send(&Envelope::Control(Command::Connect(spec)).encode())?;

        match Envelope::decode(&channel.receive()?)? {
            Envelope::Control(Command::Accept) => {
                info!("session accepted");
                Ok(Self {
                    channel,
                    segments,
                    retained: Vec::new(),
                    tracker: StageTracker::new(),
                })
            }
            Envelope::Notice(text) => {
                // Acknowledge the refusal by closing the session, so the
                // peer's relay ends instead of waiting for a reconnect.
                let _ = channel.send(&[]);
                Err(SplitErr::PeerNotice(text))
            }
            other => {
                let _ = channel.send(&[]);
                Err(SplitErr::UnexpectedEnvelope {
                    got: other.kind_name(),
                    expected: "accept",
                })
            }
        }
    }

    /// Computes the forward result of all model segments, crossing the wire
    /// at every boundary between consecutive local segments.
    ///
    /// # Args
    /// * `input` - The serialized input activation.
    ///
    /// # Returns
    /// The model output activation, with every boundary activation retained
    /// for the matching [`backward`](Self::backward) call.
    pub fn forward(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        // A cycle must start clean; leftovers mean the previous backward pass
        // never ran to completion.
        if !self.retained.is_empty() {
            return Err(SplitErr::StaleState {
                op: "forward",
                retained: self.retained.len(),
            });
        }
        self.tracker.advance(ExchangeState::Forwarding, 0)?;

        let mut x = input.to_vec();
        for index in 0..self.segments.len() {
            let y = self.segments[index].run_forward(&x)?;
            self.retained.push(y.clone());

            if index + 1 == self.segments.len() {
                self.tracker
                    .advance(ExchangeState::Backpropagating, self.retained.len())?;
                return Ok(y);
            }

            debug!(boundary = index; "sending boundary activation");
            self.tracker
                .advance(ExchangeState::AwaitingReply, self.retained.len())?;
            self.channel
                .send(&envelope::encode_tensor(Stage::Forward, &y))?;

            x = self.recv_tensor(Stage::Forward)?;
            self.tracker
                .advance(ExchangeState::Forwarding, self.retained.len())?;
        }

        unreachable!("a client holds at least one segment")
    }

    /// Computes the backward result of all model segments, walking the
    /// retained activations in strict reverse order.
    ///
    /// # Args
    /// * `grad` - The gradient at the model output.
    ///
    /// # Returns
    /// The gradient at the model input. The terminal boundary sends nothing
    /// onward; there is nothing further upstream.
    pub fn backward(&mut self, grad: &[u8]) -> Result<Vec<u8>> {
        self.tracker
            .require(ExchangeState::Backpropagating, self.retained.len())?;

        let mut g = grad.to_vec();
        for index in (0..self.segments.len()).rev() {
            let output = self.retained.pop().ok_or(SplitErr::StaleState {
                op: "backward",
                retained: 0,
            })?;

            if g.len() != output.len() {
                return Err(SplitErr::GradientLengthMismatch {
                    boundary: index,
                    got: g.len(),
                    expected: output.len(),
                });
            }

            g = self.segments[index].run_backward(&g)?;

            if index > 0 {
                debug!(boundary = index - 1; "sending boundary gradient");
                self.channel
                    .send(&envelope::encode_tensor(Stage::Backward, &g))?;
                g = self.recv_tensor(Stage::Backward)?;
            }
        }

        self.tracker.advance(ExchangeState::Done, self.retained.len())?;
        Ok(g)
    }

    /// Ends the session by sending the empty-payload shutdown sentinel.
    pub fn shutdown(mut self) -> Result<()> {
        info!("closing split session");
        self.channel.send(&[])?;
        Ok(())
    }

    pub fn metrics(&self) -> &comms::ChannelMetrics {
        self.channel.metrics()
    }

    fn recv_tensor(&mut self, expected: Stage) -> Result<Vec<u8>> {
        let envelope = Envelope::decode(&self.channel.receive()?)?;

        // A textual placeholder where a tensor belongs means "not ready yet"
        // and is granted exactly one more receive. A single fallback, never
        // a general retry; suspect behavior, kept as-is.
        let envelope = match envelope {
            Envelope::Notice(text) => {
                warn!("placeholder notice instead of a tensor: {text}; receiving once more");
                Envelope::decode(&self.channel.receive()?)?
            }
            other => other,
        };

        match envelope {
            Envelope::Tensor { stage, bytes } if stage == expected => Ok(bytes),
            Envelope::Tensor { stage, .. } => Err(SplitErr::UnexpectedStage {
                got: stage,
                expected,
            }),
            Envelope::Notice(text) => Err(SplitErr::PeerNotice(text)),
            other => Err(SplitErr::UnexpectedEnvelope {
                got: other.kind_name(),
                expected: "tensor",
            }),
        }
    }
}
