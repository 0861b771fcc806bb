//! Clock service demo: answers `get_time` calls and broadcasts a tick
//! event to every connected client once a second.
//!
//! Run with `cargo run --example clock_service`, then connect one or more
//! `clock_client` processes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use wirecall::codec::JsonCodec;
use wirecall::net::TcpAcceptor;
use wirecall::{CallContext, Responder, Service};

#[derive(Serialize, Deserialize, Debug, Clone)]
enum ClockEvent {
    Tick { epoch_seconds: u64 },
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async {
        let acceptor = TcpAcceptor::bind("127.0.0.1:4096");
        let service = Service::<JsonCodec, ClockEvent>::builder("Clock")
            .handle(
                "get_time",
                |_ctx: CallContext, (): (), reply: Responder<JsonCodec, u64>| {
                    reply.ok(now_seconds());
                    Ok(())
                },
            )
            .build(acceptor.clone())?;
        service.start(16)?;
        tracing::info!(addr = ?acceptor.local_addr(), "clock service listening");

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let clients = service.get_clients().len();
            if clients > 0 {
                tracing::info!(clients, "broadcasting tick");
            }
            service.broadcast_event(&ClockEvent::Tick {
                epoch_seconds: now_seconds(),
            });
        }
    })
}
