//! Reliable delivery of one payload at a time over one long-lived TCP
//! connection.
//!
//! Acknowledgement is application-level and independent of TCP's own
//! reliability: the receiver verifies the frame digest and answers with a
//! 3-byte token, and the sender resends the identical frame on anything other
//! than a positive acknowledgement, up to a fixed ceiling. A receive-side
//! socket timeout means the peer is gone and triggers re-establishment of the
//! connection on the same endpoint.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    error::{CommsErr, Result},
    frame,
};

const CHUNK_SIZE: usize = 4096;

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Receive timeout applied to every accepted or dialed stream.
    pub recv_timeout: Duration,
    /// Ceiling on send and receive attempts before giving up.
    pub retry_limit: usize,
    /// Pause between connection setup attempts.
    pub reconnect_pause: Duration,
    /// Ceiling on timeout-triggered reconnections within one receive call.
    pub reconnect_limit: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(10),
            retry_limit: 1000,
            reconnect_pause: Duration::from_secs(1),
            reconnect_limit: 8,
        }
    }
}

/// Counters observed across the lifetime of one channel.
#[derive(Debug, Default, Clone)]
pub struct ChannelMetrics {
    pub frames_sent: u64,
    pub send_retries: u64,
    pub nacks_sent: u64,
    pub reconnects: u64,
}

impl ChannelMetrics {
    #[inline]
    fn bump_frame(&mut self) {
        self.frames_sent += 1;
    }

    #[inline]
    fn bump_send_retry(&mut self) {
        self.send_retries += 1;
    }

    #[inline]
    fn bump_nack(&mut self) {
        self.nacks_sent += 1;
    }

    #[inline]
    fn bump_reconnect(&mut self) {
        self.reconnects += 1;
    }
}

/// Where a channel goes back to when it must replace its connection.
enum Endpoint {
    /// The accepting role keeps its listener and re-accepts.
    Accepting(TcpListener),
    /// The dialing role remembers the peer address and re-dials.
    Dialing(SocketAddr),
}

impl Endpoint {
    fn reopen(&self, cfg: &ChannelConfig) -> io::Result<TcpStream> {
        let stream = match self {
            Endpoint::Accepting(listener) => {
                let (stream, peer) = listener.accept()?;
                info!("peer reconnected from {peer}");
                stream
            }
            Endpoint::Dialing(addr) => {
                let stream = TcpStream::connect(addr)?;
                info!("reconnected to {addr}");
                stream
            }
        };

        stream.set_read_timeout(Some(cfg.recv_timeout))?;
        Ok(stream)
    }
}

/// A bound listener that has not yet accepted its single peer.
///
/// Split from [`ReliableChannel::listen`] so callers binding to port 0 can
/// learn the assigned address before blocking in accept.
pub struct Acceptor {
    listener: TcpListener,
    cfg: ChannelConfig,
}

impl Acceptor {
    /// Binds a listener on `addr`.
    pub fn bind(addr: SocketAddr, cfg: ChannelConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, cfg })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts exactly one peer and applies the receive timeout to it.
    pub fn accept(self) -> io::Result<ReliableChannel> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_read_timeout(Some(self.cfg.recv_timeout))?;
        info!("peer connected from {peer}");

        Ok(ReliableChannel::with_stream(
            stream,
            Endpoint::Accepting(self.listener),
            self.cfg,
        ))
    }
}

/// One checksum-acknowledged byte channel over one TCP connection.
pub struct ReliableChannel {
    stream: TcpStream,
    endpoint: Endpoint,
    /// Bytes already read past the previous frame's terminator.
    carry: Vec<u8>,
    cfg: ChannelConfig,
    metrics: ChannelMetrics,
}

impl ReliableChannel {
    fn with_stream(stream: TcpStream, endpoint: Endpoint, cfg: ChannelConfig) -> Self {
        Self {
            stream,
            endpoint,
            carry: Vec::new(),
            cfg,
            metrics: ChannelMetrics::default(),
        }
    }

    /// Binds, accepts one peer, and keeps retrying until both succeed.
    ///
    /// There is no peer to negotiate shutdown with until one connects, so
    /// setup failures pause for `cfg.reconnect_pause` and retry without bound.
    pub fn listen(addr: SocketAddr, cfg: ChannelConfig) -> Self {
        loop {
            let attempt = Acceptor::bind(addr, cfg.clone()).and_then(Acceptor::accept);
            match attempt {
                Ok(channel) => return channel,
                Err(e) => {
                    warn!("socket setup failed: {e}, retrying");
                    thread::sleep(cfg.reconnect_pause);
                }
            }
        }
    }

    /// Dials the accepting peer at `addr`.
    pub fn connect(addr: SocketAddr, cfg: ChannelConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(cfg.recv_timeout))?;
        info!("connected to {addr}");

        Ok(Self::with_stream(stream, Endpoint::Dialing(addr), cfg))
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Delivers `payload`, resending the identical frame until the peer
    /// acknowledges it.
    ///
    /// # Errors
    /// `SendExhausted` after `cfg.retry_limit` unacknowledged attempts. The
    /// connection is left open; exhaustion is the caller's problem, not the
    /// channel's.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let encoded = frame::encode(payload);
        let limit = self.cfg.retry_limit;

        for attempt in 1..=limit {
            if attempt > 1 {
                self.metrics.bump_send_retry();
            }

            if let Err(e) = self.stream.write_all(&encoded) {
                warn!(attempt = attempt; "failed to write frame: {e}");
                continue;
            }
            self.metrics.bump_frame();

            match self.read_reply() {
                Ok(token) if token == *frame::ACK => {
                    debug!(bytes = payload.len(); "frame acknowledged");
                    return Ok(());
                }
                Ok(_) => warn!(attempt = attempt; "peer rejected frame, resending"),
                Err(e) => warn!(attempt = attempt; "no acknowledgement: {e}"),
            }
        }

        Err(CommsErr::SendExhausted { attempts: limit })
    }

    /// Blocks for the next verified payload.
    ///
    /// Corrupted frames are answered with [`frame::NAK`] and read again, up to
    /// the retry ceiling. A socket timeout (or a dead connection) discards the
    /// stream and re-establishes it on the same endpoint, as an explicit loop
    /// bounded by `cfg.reconnect_limit`.
    ///
    /// # Errors
    /// `EmptyPayload` for the deliberate-shutdown sentinel (acknowledged like
    /// any valid frame), `ReceiveExhausted` or `ReconnectExhausted` once the
    /// respective ceiling is hit.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        let limit = self.cfg.retry_limit;
        let mut attempts = 0;
        let mut reconnects = 0;

        while attempts < limit {
            match self.read_frame() {
                Ok(payload) => {
                    self.reply(frame::ACK)?;
                    debug!(bytes = payload.len(); "frame verified");
                    return Ok(payload);
                }
                Err(CommsErr::EmptyPayload) => {
                    self.reply(frame::ACK)?;
                    info!("peer signalled shutdown");
                    return Err(CommsErr::EmptyPayload);
                }
                Err(CommsErr::ChecksumMismatch) => {
                    warn!("checksum mismatch, requesting resend");
                    self.reply(frame::NAK)?;
                    self.metrics.bump_nack();
                    attempts += 1;
                }
                Err(CommsErr::Io(e)) if peer_is_gone(&e) => {
                    reconnects += 1;
                    if reconnects > self.cfg.reconnect_limit {
                        return Err(CommsErr::ReconnectExhausted {
                            attempts: self.cfg.reconnect_limit,
                        });
                    }

                    warn!("peer unresponsive ({e}), re-establishing connection");
                    if let Err(e) = self.reestablish() {
                        warn!("re-establishing failed: {e}");
                        thread::sleep(self.cfg.reconnect_pause);
                    }
                }
                Err(CommsErr::Io(e)) => {
                    warn!("socket error while receiving: {e}");
                    attempts += 1;
                }
                Err(other) => return Err(other),
            }
        }

        Err(CommsErr::ReceiveExhausted { attempts: limit })
    }

    /// Reads until the carried bytes hold one complete frame, then verifies it.
    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            if let Some((body, rest)) = frame::split(&self.carry) {
                let verdict = frame::verify(body).map(<[u8]>::to_vec);
                let rest = rest.to_vec();
                self.carry = rest;
                return verdict;
            }

            let read = self.stream.read(&mut chunk)?;
            if read == 0 {
                return Err(CommsErr::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            self.carry.extend_from_slice(&chunk[..read]);
        }
    }

    fn read_reply(&mut self) -> io::Result<[u8; 3]> {
        let mut token = [0u8; 3];
        self.stream.read_exact(&mut token)?;
        Ok(token)
    }

    fn reply(&mut self, token: &[u8; 3]) -> Result<()> {
        self.stream.write_all(token)?;
        Ok(())
    }

    /// Replaces the connection using the retained endpoint.
    ///
    /// Any carried bytes belong to the dead connection and are dropped; the
    /// cycle they belonged to is lost with no rollback.
    fn reestablish(&mut self) -> io::Result<()> {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.carry.clear();

        if let Endpoint::Dialing(_) = self.endpoint {
            thread::sleep(self.cfg.reconnect_pause);
        }

        self.stream = self.endpoint.reopen(&self.cfg)?;
        self.metrics.bump_reconnect();
        Ok(())
    }
}

/// Read errors that mean the connection is unusable rather than transiently
/// noisy: timeouts and the various shapes of a closed peer.
fn peer_is_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
