//! The server side of a split model: the compute loop consuming the
//! rendezvous and the wiring that pairs it with a network relay thread.

use std::thread;

use comms::{
    rendezvous::{self, ComputeEndpoint},
    CommsErr, ReliableChannel,
};
use log::{debug, info, warn};

use crate::{
    envelope::{self, Command, Envelope, Stage},
    error::{Result, SplitErr},
    segment::SegmentCompute,
    stage::{ExchangeState, StageTracker},
};

/// Drives the staged exchange for the serving side: every taken envelope is
/// answered with exactly one reply, so the relay's strict alternation holds.
pub struct SplitServer {
    endpoint: ComputeEndpoint<Vec<u8>>,
    segments: Vec<Box<dyn SegmentCompute>>,
    /// Layer-exchange cursor: advanced per forward, walked back per backward.
    cursor: usize,
    /// Output byte lengths of forwarded segments, for gradient validation.
    retained: Vec<usize>,
    tracker: StageTracker,
}

impl SplitServer {
    /// Builds the compute side of a split server.
    ///
    /// # Args
    /// * `endpoint` - The compute endpoint of an explicitly constructed
    ///   rendezvous pair; the network endpoint goes to [`comms::relay`].
    /// * `segments` - The locally held model segments, in model order. One
    ///   segment serves one split boundary.
    pub fn new(endpoint: ComputeEndpoint<Vec<u8>>, segments: Vec<Box<dyn SegmentCompute>>) -> Self {
        Self {
            endpoint,
            segments,
            cursor: 0,
            retained: Vec::new(),
            tracker: StageTracker::new(),
        }
    }

    /// Runs the compute loop until the session ends.
    ///
    /// A hang-up from the relay side is the normal end of a session (the peer
    /// sent the shutdown sentinel); protocol violations are fatal errors.
    pub fn run(mut self) -> Result<()> {
        if !self.handshake()? {
            return Ok(());
        }

        loop {
            let Ok(bytes) = self.endpoint.take() else {
                info!("relay ended, compute loop exiting");
                return Ok(());
            };

            // A placeholder notice cannot be granted a second take here: the
            // relay sends our reply before it receives again, so the second
            // take would never be satisfied. Rejected outright.
            match Envelope::decode(&bytes)? {
                Envelope::Tensor {
                    stage: Stage::Forward,
                    bytes,
                } => self.step_forward(&bytes)?,
                Envelope::Tensor {
                    stage: Stage::Backward,
                    bytes,
                } => self.step_backward(&bytes)?,
                Envelope::Notice(text) => return Err(SplitErr::PeerNotice(text)),
                other => {
                    return Err(SplitErr::UnexpectedEnvelope {
                        got: other.kind_name(),
                        expected: "tensor",
                    });
                }
            }
        }
    }

    /// Waits for the session announcement and answers it.
    ///
    /// # Returns
    /// `false` if the relay ended before any announcement arrived.
    fn handshake(&mut self) -> Result<bool> {
        info!("waiting for session announcement");

        let Ok(bytes) = self.endpoint.take() else {
            info!("relay ended before bootstrap");
            return Ok(false);
        };

        let spec = match Envelope::decode(&bytes)? {
            Envelope::Control(Command::Connect(spec)) => spec,
            other => {
                warn!("expected a session announcement, got {}", other.kind_name());
                return Err(SplitErr::UnexpectedEnvelope {
                    got: other.kind_name(),
                    expected: "connect",
                });
            }
        };

        if spec.boundaries != self.segments.len() {
            let refusal = format!(
                "split layout mismatch: peer announced {} boundaries, this side holds {} segments",
                spec.boundaries,
                self.segments.len()
            );
            warn!("{refusal}");
            self.reply(Envelope::Notice(refusal).encode())?;

            return Err(SplitErr::SessionMismatch {
                got: spec.boundaries,
                expected: self.segments.len(),
            });
        }

        info!(boundaries = spec.boundaries; "session accepted");
        self.reply(Envelope::Control(Command::Accept).encode())?;
        Ok(true)
    }

    fn step_forward(&mut self, input: &[u8]) -> Result<()> {
        if self.cursor == self.segments.len() {
            return Err(SplitErr::StaleState {
                op: "forward",
                retained: self.retained.len(),
            });
        }
        if self.cursor == 0 {
            self.tracker
                .advance(ExchangeState::Forwarding, self.retained.len())?;
        }

        debug!(cursor = self.cursor; "running forward segment");
        let output = self.segments[self.cursor].run_forward(input)?;
        self.retained.push(output.len());
        self.cursor += 1;

        self.reply(envelope::encode_tensor(Stage::Forward, &output))
    }

    fn step_backward(&mut self, grad: &[u8]) -> Result<()> {
        if self.tracker.state() == ExchangeState::Forwarding {
            // The backward walk may only begin once every segment has run.
            if self.cursor != self.segments.len() {
                return Err(SplitErr::StaleState {
                    op: "backward",
                    retained: self.retained.len(),
                });
            }
            self.tracker
                .advance(ExchangeState::Backpropagating, self.retained.len())?;
        }
        self.tracker
            .require(ExchangeState::Backpropagating, self.retained.len())?;

        if self.cursor == 0 {
            return Err(SplitErr::StaleState {
                op: "backward",
                retained: self.retained.len(),
            });
        }

        self.cursor -= 1;
        let expected = self.retained.pop().ok_or(SplitErr::StaleState {
            op: "backward",
            retained: 0,
        })?;

        if grad.len() != expected {
            return Err(SplitErr::GradientLengthMismatch {
                boundary: self.cursor,
                got: grad.len(),
                expected,
            });
        }

        debug!(cursor = self.cursor; "running backward segment");
        let upstream = self.segments[self.cursor].run_backward(grad)?;

        if self.cursor == 0 {
            // Cycle complete: the retained record must have drained with it.
            debug_assert!(self.retained.is_empty());
            self.tracker.advance(ExchangeState::Done, self.retained.len())?;
        }

        self.reply(envelope::encode_tensor(Stage::Backward, &upstream))
    }

    fn reply(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.endpoint
            .reply(bytes)
            .map_err(|_| SplitErr::Comms(CommsErr::Closed))
    }
}

/// Runs both threads of a split server over an accepted channel: the network
/// relay on a spawned thread, the compute loop on the calling one.
///
/// # Args
/// * `channel` - The accepted connection; the relay takes exclusive ownership.
/// * `segments` - The locally held model segments, in model order.
pub fn serve(mut channel: ReliableChannel, segments: Vec<Box<dyn SegmentCompute>>) -> Result<()> {
    let (net, compute) = rendezvous::pair();

    let relay = thread::spawn(move || comms::relay(&mut channel, net));

    let compute_result = SplitServer::new(compute, segments).run();

    // Dropping our endpoint (run consumed it) unblocks the relay if it is
    // still waiting; a panicked relay thread is reported as a closed channel.
    let relay_result = relay.join().unwrap_or(Err(CommsErr::Closed));

    compute_result.and(relay_result.map_err(SplitErr::from))
}
