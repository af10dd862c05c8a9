//! Header-codec server: answers PING with PONG, echoes DATA from a worker
//! thread, and counts frames per connection.
//!
//! ```text
//! cargo run --example codec_server -- tcp://:9000
//! RUST_LOG=mill_loop=debug cargo run --example codec_server
//! ```

use std::time::Duration;

use anyhow::Context;
use mill_loop::{codec::command, prelude::*, Error};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct FrameCount(u64);

struct CodecHandler {
    workers: WorkerPool,
}

impl EventHandler for CodecHandler {
    type Frame = HeaderFrame;

    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        info!(
            addr = %server.local_addr,
            loops = server.num_event_loop,
            balancing = ?server.load_balancing,
            "ready"
        );
        Action::None
    }

    fn on_opened(&self, conn: &mut Connection<HeaderFrame>) -> Action {
        conn.set_context(FrameCount(0));
        info!(conn = %conn.id(), peer = %conn.peer_addr(), event_loop = conn.loop_index(), "opened");
        Action::None
    }

    fn on_closed(&self, conn: &mut Connection<HeaderFrame>, error: Option<&Error>) -> Action {
        let frames = conn.context::<FrameCount>().map_or(0, |count| count.0);
        match error {
            Some(e) => warn!(conn = %conn.id(), frames, error = %e, "closed"),
            None => info!(conn = %conn.id(), frames, "closed"),
        }
        Action::None
    }

    fn react(
        &self,
        frame: HeaderFrame,
        conn: &mut Connection<HeaderFrame>,
    ) -> (Option<HeaderFrame>, Action) {
        if let Some(count) = conn.context_mut::<FrameCount>() {
            count.0 += 1;
        }

        match frame.command_id {
            command::PING => (Some(HeaderFrame::new(command::PONG, frame.body)), Action::None),
            command::DATA => {
                let submitted = self.workers.reply(conn.handle(), move || {
                    // stand-in for blocking work
                    std::thread::sleep(Duration::from_millis(5));
                    Some(HeaderFrame::new(command::DATA, frame.body))
                });
                match submitted {
                    Ok(()) => (None, Action::None),
                    Err(_) => (None, Action::Close),
                }
            }
            _ => (None, Action::None),
        }
    }

    fn on_shutdown(&self, server: &ServerInfo) {
        info!(addr = %server.local_addr, "shut down");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://:9000".to_string());
    let config = ServerConfig::builder()
        .address(parse_address(&address).with_context(|| format!("bad address {address}"))?)
        .multicore(true)
        .tcp_keep_alive(Some(Duration::from_secs(300)))
        .build();

    let handler = CodecHandler {
        workers: WorkerPool::with_available_parallelism().context("starting workers")?,
    };
    serve(handler, HeaderCodec::new(), config).context("server failed")?;
    Ok(())
}
