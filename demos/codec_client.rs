//! Sends a PING and a few DATA frames to `codec_server` and prints replies.
//!
//! ```text
//! cargo run --example codec_client -- 127.0.0.1:9000
//! ```

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use anyhow::{bail, Context};
use mill_loop::{codec::command, prelude::*, RingBuffer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let addr = parse_address(&address)?;
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connect {addr}"))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let codec = HeaderCodec::new();
    let mut requests = vec![HeaderFrame::new(command::PING, &b"ping"[..])];
    for i in 0..3 {
        requests.push(HeaderFrame::new(command::DATA, format!("payload {i}").into_bytes()));
    }

    // everything in one write: the server sees back-to-back frames
    let mut wire = Vec::new();
    for request in &requests {
        wire.extend_from_slice(&codec.encode(request)?);
    }
    stream.write_all(&wire)?;

    let mut buf = RingBuffer::default();
    let mut chunk = [0u8; 4096];
    let mut replies = 0;
    while replies < requests.len() {
        while let Some(reply) = codec.decode(&mut buf)? {
            replies += 1;
            info!(
                command_id = %format!("{:#06x}", reply.command_id),
                body = %String::from_utf8_lossy(&reply.body),
                "reply"
            );
        }
        if replies == requests.len() {
            break;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            bail!("server closed after {replies} replies");
        }
        buf.append(&chunk[..n]);
    }
    Ok(())
}
