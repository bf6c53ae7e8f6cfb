//! The network thread's entry point: the receive → deliver → collect → send
//! cycle that pivots between the wire and the local compute thread.

use log::{debug, info};

use crate::{
    channel::ReliableChannel,
    error::{CommsErr, Result},
    rendezvous::NetEndpoint,
};

/// Pumps the channel into the rendezvous and back, one request/response pair
/// per cycle, until either side ends the session.
///
/// A reply is sent only after the preceding request was fully consumed by the
/// compute side, so request/response pairing is strict FIFO. The empty-payload
/// sentinel from the peer ends the loop cleanly; a compute side that hung up
/// surfaces as [`CommsErr::Closed`].
///
/// # Arguments
/// * `channel` - The connection this relay exclusively owns.
/// * `net` - The network endpoint of an explicitly constructed rendezvous pair.
pub fn relay(channel: &mut ReliableChannel, net: NetEndpoint<Vec<u8>>) -> Result<()> {
    loop {
        let payload = match channel.receive() {
            Ok(payload) => payload,
            Err(CommsErr::EmptyPayload) => {
                info!("session closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!(bytes = payload.len(); "delivering payload to compute");
        if net.deliver(payload).is_err() {
            return Err(CommsErr::Closed);
        }

        let reply = net.collect().map_err(|_| CommsErr::Closed)?;
        channel.send(&reply)?;
    }
}
