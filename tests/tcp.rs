//! End-to-end tests over real TCP sockets.
//!
//! Everything runs on a current-thread runtime inside a `LocalSet`; tests
//! poll for the expected state while the local reader/writer tasks make
//! progress.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::LocalSet;
use wirecall::codec::MsgpackCodec;
use wirecall::net::{TcpAcceptor, TcpTransport};
use wirecall::{CallContext, CallResult, Client, Error, EventListener, Responder, Service};

async fn settle(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
enum TickEvent {
    Tick { seq: u32 },
}

struct TickListener {
    seen: RefCell<Vec<TickEvent>>,
}

impl EventListener<TickEvent> for TickListener {
    fn on_service_event(&self, event: TickEvent) {
        self.seen.borrow_mut().push(event);
    }
}

fn start_calculator() -> (Service<MsgpackCodec, TickEvent>, Rc<TcpAcceptor>) {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0");
    let service = Service::<MsgpackCodec, TickEvent>::builder("Calculator")
        .handle(
            "add",
            |_ctx: CallContext, (a, b, c): (i8, i16, i32), reply: Responder<MsgpackCodec, i32>| {
                reply.ok(a as i32 + b as i32 + c);
                Ok(())
            },
        )
        .handle(
            "add_and_delay_result",
            |_ctx: CallContext, (a, b): (i32, i32), reply: Responder<MsgpackCodec, i32>| {
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    reply.ok(a + b);
                });
                Ok(())
            },
        )
        .build(acceptor.clone())
        .expect("registration");
    service.start(16).expect("service start");
    (service, acceptor)
}

#[tokio::test(flavor = "current_thread")]
async fn test_simple_call_over_tcp() {
    LocalSet::new()
        .run_until(async {
            let (service, acceptor) = start_calculator();
            let addr = acceptor.local_addr().unwrap().to_string();

            let client = Client::<MsgpackCodec, TickEvent>::new(
                TcpTransport::connect_to(addr),
                "Calculator",
            );
            client.open().unwrap();

            let got = Rc::new(RefCell::new(None));
            let sink = got.clone();
            client
                .call("add", (12i8, 23i16, 34i32), move |res: CallResult<i32>| {
                    *sink.borrow_mut() = Some(res);
                })
                .unwrap();
            assert!(client.is_call_in_progress("add"));

            settle(|| got.borrow().is_some()).await;
            assert_eq!(*got.borrow(), Some(CallResult::Ok(69)));
            assert!(!client.is_call_in_progress("add"));

            service.stop();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_delayed_result_over_tcp() {
    LocalSet::new()
        .run_until(async {
            let (service, acceptor) = start_calculator();
            let addr = acceptor.local_addr().unwrap().to_string();

            let client = Client::<MsgpackCodec, TickEvent>::new(
                TcpTransport::connect_to(addr),
                "Calculator",
            );
            client.open().unwrap();

            let got = Rc::new(RefCell::new(None));
            let sink = got.clone();
            client
                .call(
                    "add_and_delay_result",
                    (321i32, 123i32),
                    move |res: CallResult<i32>| {
                        *sink.borrow_mut() = Some(res);
                    },
                )
                .unwrap();

            settle(|| got.borrow().is_some()).await;
            assert_eq!(*got.borrow(), Some(CallResult::Ok(444)));

            service.stop();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_broadcast_over_tcp() {
    LocalSet::new()
        .run_until(async {
            let (service, acceptor) = start_calculator();
            let addr = acceptor.local_addr().unwrap().to_string();

            let client = Client::<MsgpackCodec, TickEvent>::new(
                TcpTransport::connect_to(addr.clone()),
                "Calculator",
            );
            client.open().unwrap();
            let listener = Rc::new(TickListener {
                seen: RefCell::new(Vec::new()),
            });
            client.add_listener(listener.clone());

            // Wait until the service observes the session before sending.
            settle(|| !service.get_clients().is_empty()).await;
            service.broadcast_event(&TickEvent::Tick { seq: 1 });
            service.broadcast_event(&TickEvent::Tick { seq: 2 });

            settle(|| listener.seen.borrow().len() == 2).await;
            assert_eq!(
                *listener.seen.borrow(),
                vec![TickEvent::Tick { seq: 1 }, TickEvent::Tick { seq: 2 }]
            );

            service.stop();
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_async_open_connection_refused() {
    LocalSet::new()
        .run_until(async {
            // Bind a port, then close it so nothing listens there.
            let acceptor = TcpAcceptor::bind("127.0.0.1:0");
            let service = Service::<MsgpackCodec>::builder("Nobody")
                .build(acceptor.clone())
                .unwrap();
            service.start(1).unwrap();
            let addr = acceptor.local_addr().unwrap().to_string();
            service.stop();
            // Let the aborted accept task drop its socket.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }

            let client =
                Client::<MsgpackCodec>::new(TcpTransport::connect_to(addr), "Calculator");
            let outcome = Rc::new(RefCell::new(None));
            let sink = outcome.clone();
            client.open_with(move |res| {
                *sink.borrow_mut() = Some(res);
            });

            settle(|| outcome.borrow().is_some()).await;
            let outcome = outcome.borrow_mut().take().unwrap();
            assert!(matches!(outcome, Err(Error::Io(_))));
            assert!(!client.is_open());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn test_service_death_fails_outstanding_call() {
    LocalSet::new()
        .run_until(async {
            let (service, acceptor) = start_calculator();
            let addr = acceptor.local_addr().unwrap().to_string();

            let client = Client::<MsgpackCodec, TickEvent>::new(
                TcpTransport::connect_to(addr),
                "Calculator",
            );
            client.open().unwrap();

            let got = Rc::new(RefCell::new(None));
            let sink = got.clone();
            client
                .call(
                    "add_and_delay_result",
                    (1i32, 2i32),
                    move |res: CallResult<i32>| {
                        *sink.borrow_mut() = Some(res);
                    },
                )
                .unwrap();

            // Kill the service while the reply timer is still running.
            settle(|| !service.get_clients().is_empty()).await;
            service.stop();

            settle(|| got.borrow().is_some()).await;
            let got = got.borrow();
            assert!(got.as_ref().unwrap().is_err());

            let res = client.call("add", (0i8, 1i16, 2i32), |_res: CallResult<i32>| {
                panic!("call on dead session must not resolve");
            });
            assert!(matches!(res, Err(Error::NotConnected)));
        })
        .await;
}
