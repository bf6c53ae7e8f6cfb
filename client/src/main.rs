use std::{env, io, net::SocketAddr};

use comms::{ChannelConfig, ReliableChannel};
use log::info;
use rand::Rng;
use splitlearn::{
    segment::{bytes, lanes, AffineSegment, EchoSegment, SegmentCompute},
    SplitClient,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SEGMENTS: &str = "2.0,0.0";
const DEFAULT_STEPS: usize = 3;
const DEFAULT_BATCH: usize = 8;

fn main() -> io::Result<()> {
    env_logger::init();

    let addr: SocketAddr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").map_err(io::Error::other)?,
    )
    .parse()
    .map_err(io::Error::other)?;

    let steps = parse_or(env::var("STEPS").ok(), DEFAULT_STEPS)?;
    let batch = parse_or(env::var("BATCH").ok(), DEFAULT_BATCH)?;

    // The head segments run here; the trailing echo hands the peer's final
    // activation back as the model output.
    let mut segments = parse_segments(
        &env::var("SEGMENTS").unwrap_or_else(|_| DEFAULT_SEGMENTS.to_string()),
    )?;
    segments.push(Box::new(EchoSegment));

    let channel = ReliableChannel::connect(addr, ChannelConfig::default())?;
    let mut client = SplitClient::connect(channel, segments)?;

    let mut rng = rand::rng();
    for step in 0..steps {
        let input: Vec<f32> = (0..batch).map(|_| rng.random_range(-1.0..1.0)).collect();

        let output = lanes(&client.forward(&bytes(&input))?)?;
        let grad = lanes(&client.backward(&bytes(&vec![1.0; batch]))?)?;

        info!(step = step; "completed step: out {output:?} grad {grad:?}");
    }

    let metrics = client.metrics().clone();
    client.shutdown()?;
    info!(
        frames = metrics.frames_sent,
        retries = metrics.send_retries;
        "session closed"
    );

    Ok(())
}

fn parse_or(var: Option<String>, default: usize) -> io::Result<usize> {
    match var {
        Some(v) => v.parse().map_err(io::Error::other),
        None => Ok(default),
    }
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
