//! Clock client demo: calls `get_time` once, then prints every tick the
//! service broadcasts.
//!
//! Run `clock_service` first, then `cargo run --example clock_client`.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use wirecall::codec::JsonCodec;
use wirecall::net::TcpTransport;
use wirecall::{CallResult, Client, EventListener};

#[derive(Serialize, Deserialize, Debug, Clone)]
enum ClockEvent {
    Tick { epoch_seconds: u64 },
}

struct TickPrinter {
    ticks: RefCell<u32>,
}

impl EventListener<ClockEvent> for TickPrinter {
    fn on_service_event(&self, event: ClockEvent) {
        let ClockEvent::Tick { epoch_seconds } = event;
        *self.ticks.borrow_mut() += 1;
        println!("tick: {epoch_seconds}");
    }
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
        let transport = TcpTransport::connect_to("127.0.0.1:4096");
        let client = Client::<JsonCodec, ClockEvent>::new(transport, "Clock");
        client.open()?;

        let printer = Rc::new(TickPrinter {
            ticks: RefCell::new(0),
        });
        client.add_listener(printer.clone());

        client.call("get_time", (), |res: CallResult<u64>| match res {
            CallResult::Ok(secs) => println!("service time: {secs}"),
            CallResult::Err(e) => eprintln!("get_time failed: {e}"),
        })?;

        // Listen for ten ticks, then leave.
        while *printer.ticks.borrow() < 10 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if !client.is_open() {
                eprintln!("connection lost");
                break;
            }
        }
        client.close();
        Ok(())
    })
}
