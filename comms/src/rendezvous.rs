//! Synchronous hand-off between the network thread and the compute thread.
//!
//! Two independent single-capacity blocking channels form the rendezvous: one
//! carries a just-received payload inbound to the compute side, the other
//! carries the compute side's reply outbound for transmission. A sender blocks
//! while a previous item is still pending, so "at most one pending item" is
//! enforced by the channel itself rather than by call-site discipline.

use std::{error::Error, fmt, sync::Arc};

use parking_lot::{Condvar, Mutex};

struct State<T> {
    value: Option<T>,
    tx_alive: bool,
    rx_alive: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// The sending half of a single-capacity blocking channel.
pub struct SlotSender<T> {
    shared: Arc<Shared<T>>,
}

/// The receiving half of a single-capacity blocking channel.
pub struct SlotReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a single-capacity blocking channel.
///
/// # Returns
/// The sender and receiver halves. Neither half is cloneable; each side of
/// the rendezvous owns exactly one.
pub fn slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            value: None,
            tx_alive: true,
            rx_alive: true,
        }),
        cond: Condvar::new(),
    });

    (
        SlotSender {
            shared: Arc::clone(&shared),
        },
        SlotReceiver { shared },
    )
}

/// Returned by [`SlotSender::send`] when the receiver hung up; carries the
/// undelivered item back to the caller.
pub struct SendError<T>(pub T);

/// Returned by [`SlotReceiver::recv`] when the sender hung up with the slot
/// empty.
#[derive(Debug, PartialEq, Eq)]
pub struct RecvError;

impl<T> SlotSender<T> {
    /// Places `value` into the slot, blocking while a previous item is still
    /// pending.
    ///
    /// # Errors
    /// Returns the value back inside `SendError` if the receiver hung up.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.shared.state.lock();

        while state.value.is_some() && state.rx_alive {
            self.shared.cond.wait(&mut state);
        }

        if !state.rx_alive {
            return Err(SendError(value));
        }

        state.value = Some(value);
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl<T> SlotReceiver<T> {
    /// Takes the pending item, blocking until one is placed.
    ///
    /// # Errors
    /// Returns `RecvError` if the sender hung up and the slot is empty.
    pub fn recv(&self) -> Result<T, RecvError> {
        let mut state = self.shared.state.lock();

        while state.value.is_none() && state.tx_alive {
            self.shared.cond.wait(&mut state);
        }

        match state.value.take() {
            Some(value) => {
                self.shared.cond.notify_all();
                Ok(value)
            }
            None => Err(RecvError),
        }
    }
}

impl<T> Drop for SlotSender<T> {
    fn drop(&mut self) {
        self.shared.state.lock().tx_alive = false;
        self.shared.cond.notify_all();
    }
}

impl<T> Drop for SlotReceiver<T> {
    fn drop(&mut self) {
        self.shared.state.lock().rx_alive = false;
        self.shared.cond.notify_all();
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rendezvous receiver hung up")
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rendezvous sender hung up")
    }
}

impl<T> Error for SendError<T> {}
impl Error for RecvError {}

/// The network thread's view of the rendezvous: delivers received payloads
/// inbound and collects the compute side's replies for transmission.
pub struct NetEndpoint<T> {
    inbound: SlotSender<T>,
    outbound: SlotReceiver<T>,
}

/// The compute thread's view of the rendezvous: takes delivered payloads and
/// replies with the result of local computation.
pub struct ComputeEndpoint<T> {
    inbound: SlotReceiver<T>,
    outbound: SlotSender<T>,
}

/// Creates both rendezvous endpoints.
///
/// The pair is explicitly owned: hand one endpoint to the network thread's
/// entry point and the other to the compute thread's, and the request/response
/// pairing holds by construction.
pub fn pair<T>() -> (NetEndpoint<T>, ComputeEndpoint<T>) {
    let (in_tx, in_rx) = slot();
    let (out_tx, out_rx) = slot();

    (
        NetEndpoint {
            inbound: in_tx,
            outbound: out_rx,
        },
        ComputeEndpoint {
            inbound: in_rx,
            outbound: out_tx,
        },
    )
}

impl<T> NetEndpoint<T> {
    /// Hands a received payload to the compute side.
    pub fn deliver(&self, item: T) -> Result<(), SendError<T>> {
        self.inbound.send(item)
    }

    /// Blocks for the compute side's reply to the preceding delivery.
    pub fn collect(&self) -> Result<T, RecvError> {
        self.outbound.recv()
    }
}

impl<T> ComputeEndpoint<T> {
    /// Blocks for the next delivered payload.
    pub fn take(&self) -> Result<T, RecvError> {
        self.inbound.recv()
    }

    /// Hands the computation result back for transmission.
    pub fn reply(&self, item: T) -> Result<(), SendError<T>> {
        self.outbound.send(item)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn hands_one_item_across_threads() {
        let (tx, rx) = slot();

        let handle = thread::spawn(move || tx.send(7usize));
        assert_eq!(rx.recv(), Ok(7));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn sender_blocks_until_slot_is_drained() {
        static PLACED: AtomicUsize = AtomicUsize::new(0);

        let (tx, rx) = slot();
        let handle = thread::spawn(move || {
            tx.send(1usize).unwrap();
            PLACED.fetch_add(1, Ordering::SeqCst);
            tx.send(2usize).unwrap();
            PLACED.fetch_add(1, Ordering::SeqCst);
        });

        // The second send must not complete while the first item is pending.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(PLACED.load(Ordering::SeqCst), 1);

        assert_eq!(rx.recv(), Ok(1));
        assert_eq!(rx.recv(), Ok(2));
        handle.join().unwrap();
    }

    #[test]
    fn recv_fails_after_sender_hangs_up() {
        let (tx, rx) = slot::<u8>();
        drop(tx);
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn send_returns_the_item_after_receiver_hangs_up() {
        let (tx, rx) = slot();
        drop(rx);

        let SendError(value) = tx.send(9usize).unwrap_err();
        assert_eq!(value, 9);
    }

    #[test]
    fn pending_item_is_still_received_after_sender_drops() {
        let (tx, rx) = slot();
        tx.send(3usize).unwrap();
        drop(tx);

        assert_eq!(rx.recv(), Ok(3));
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn replies_pair_with_requests_in_order() {
        const ROUNDS: usize = 100;

        let (net, compute) = pair();

        let echo = thread::spawn(move || {
            while let Ok(n) = compute.take() {
                if compute.reply(n * 2).is_err() {
                    break;
                }
            }
        });

        for round in 0..ROUNDS {
            net.deliver(round).unwrap();
            assert_eq!(net.collect(), Ok(round * 2));
        }

        drop(net);
        echo.join().unwrap();
    }
}
