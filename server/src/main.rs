use std::{env, io, net::SocketAddr};

use comms::{ChannelConfig, ReliableChannel};
use log::info;
use splitlearn::segment::{AffineSegment, SegmentCompute};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SEGMENTS: &str = "2.0,0.0";

fn main() -> io::Result<()> {
    env_logger::init();

    let addr: SocketAddr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").map_err(io::Error::other)?,
    )
    .parse()
    .map_err(io::Error::other)?;

    let segments = parse_segments(
        &env::var("SEGMENTS").unwrap_or_else(|_| DEFAULT_SEGMENTS.to_string()),
    )?;
    info!(segments = segments.len(); "serving split segments at {addr}");

    let channel = ReliableChannel::listen(addr, ChannelConfig::default());
    splitlearn::serve(channel, segments)?;

    info!("session finished");
    Ok(())
}

/// Parses `scale,shift` pairs separated by semicolons, one per held segment.
fn parse_segments(spec: &str) -> io::Result<Vec<Box<dyn SegmentCompute>>> {
    spec.split(';')
        .map(|pair| {
            let (scale, shift) = pair
                .split_once(',')
                .ok_or_else(|| io::Error::other(format!("bad segment spec '{pair}'")))?;

            let scale = scale.trim().parse().map_err(io::Error::other)?;
            let shift = shift.trim().parse().map_err(io::Error::other)?;

            Ok(Box::new(AffineSegment::new(scale, shift)) as Box<dyn SegmentCompute>)
        })
        .collect()
}
