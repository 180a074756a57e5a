//! Raw echo server on TCP and UDP.
//!
//! ```text
//! cargo run --example raw_echo -- 127.0.0.1:7681 [udp-loss-percent]
//! nc 127.0.0.1 7681
//! nc -u 127.0.0.1 7681
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use mill_raw::prelude::*;
use mio::net::UdpSocket;
use mio::Token;
use tracing::info;

/// Per-connection storage: bytes echoed so far.
const SESSION_BYTES: usize = std::mem::size_of::<u64>();

#[derive(Default)]
struct Echo {
    open: AtomicUsize,
}

impl RawHandler for Echo {
    fn on_adopt(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let open = self.open.fetch_add(1, Ordering::Relaxed) + 1;
        info!(conn = ?ctx.id(), peer = ?ctx.peer_addr(), open, "adopted");
        Ok(())
    }

    fn on_rx(&self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> Result<()> {
        if let Some(space) = ctx.user_space() {
            let mut total = [0u8; SESSION_BYTES];
            total.copy_from_slice(&space[..SESSION_BYTES]);
            let total = u64::from_ne_bytes(total) + data.len() as u64;
            space[..SESSION_BYTES].copy_from_slice(&total.to_ne_bytes());
        }
        ctx.write(data)?;
        Ok(())
    }

    fn on_close(&self, ctx: &mut ConnCtx<'_>) -> Result<()> {
        let echoed = ctx
            .user_space()
            .map(|space| {
                let mut total = [0u8; SESSION_BYTES];
                total.copy_from_slice(&space[..SESSION_BYTES]);
                u64::from_ne_bytes(total)
            })
            .unwrap_or(0);
        self.open.fetch_sub(1, Ordering::Relaxed);
        info!(conn = ?ctx.id(), echoed, "closed");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut args = std::env::args().skip(1);
    let address = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7681".to_string())
        .parse()
        .context("invalid listen address")?;
    let loss: u8 = match args.next() {
        Some(p) => p.parse().context("invalid loss percent")?,
        None => 0,
    };

    let config = RawConfig::builder()
        .address(address)
        .udp_loss_sim_rx_percent(loss)
        .build()?;
    let event_loop = EventLoop::from_config(&config)?;

    let protocol = Protocol::new("echo", Echo::default()).with_session_data(SESSION_BYTES);
    let server = RawServer::new(config, Vhost::single("default", protocol))?;
    server.start(&event_loop, Token(0))?;

    let udp = UdpSocket::bind(address).context("binding udp socket")?;
    let udp_id = server.adopt_udp(udp)?;
    info!(%address, ?udp_id, loss, "echoing on tcp and udp");

    event_loop.run()?;
    Ok(())
}
