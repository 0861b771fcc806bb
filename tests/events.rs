//! Broadcast event tests over the loopback transport.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use wirecall::codec::{JsonCodec, MsgpackCodec};
use wirecall::loopback::{LoopbackAcceptor, LoopbackHub};
use wirecall::{Client, Codec, EventListener, Service};

/// Closed set of event subtypes; the codec's enum tagging discriminates
/// on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
enum MonitorEvent {
    Text { text: String },
    Count { n: i32 },
    Table { map: BTreeMap<String, i32> },
}

struct CollectingListener {
    seen: RefCell<Vec<MonitorEvent>>,
}

impl CollectingListener {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            seen: RefCell::new(Vec::new()),
        })
    }
}

impl EventListener<MonitorEvent> for CollectingListener {
    fn on_service_event(&self, event: MonitorEvent) {
        self.seen.borrow_mut().push(event);
    }
}

fn start_monitor<C: Codec>(hub: &LoopbackHub) -> (Service<C, MonitorEvent>, Rc<LoopbackAcceptor>) {
    let acceptor = LoopbackAcceptor::new(hub);
    let service = Service::<C, MonitorEvent>::builder("Monitor")
        .build(acceptor.clone())
        .expect("monitor registration");
    service.start(-1).expect("service start");
    (service, acceptor)
}

fn open_client<C: Codec>(
    acceptor: &LoopbackAcceptor,
    hub: &LoopbackHub,
) -> Client<C, MonitorEvent> {
    let client = Client::<C, MonitorEvent>::new(acceptor.connect().unwrap(), "Monitor");
    client.open().unwrap();
    hub.run_until_idle();
    client
}

fn sample_events() -> Vec<MonitorEvent> {
    let mut map = BTreeMap::new();
    map.insert("one".to_string(), 1);
    map.insert("two".to_string(), 2);
    map.insert("three".to_string(), 3);
    vec![
        MonitorEvent::Text {
            text: "test event class one".into(),
        },
        MonitorEvent::Count { n: 123_654 },
        MonitorEvent::Table { map },
    ]
}

fn every_subtype_roundtrips<C: Codec>() {
    let hub = LoopbackHub::new();
    let (service, acceptor) = start_monitor::<C>(&hub);
    let client = open_client::<C>(&acceptor, &hub);

    let listener = CollectingListener::new();
    client.add_listener(listener.clone());

    let events = sample_events();
    for event in &events {
        service.broadcast_event(event);
    }
    hub.run_until_idle();

    assert_eq!(*listener.seen.borrow(), events);
}

#[test]
fn test_every_subtype_roundtrips_msgpack() {
    every_subtype_roundtrips::<MsgpackCodec>();
}

#[test]
fn test_every_subtype_roundtrips_json() {
    every_subtype_roundtrips::<JsonCodec>();
}

#[test]
fn test_every_client_receives_broadcast() {
    let hub = LoopbackHub::new();
    let (service, acceptor) = start_monitor::<MsgpackCodec>(&hub);

    let clients: Vec<_> = (0..3)
        .map(|_| open_client::<MsgpackCodec>(&acceptor, &hub))
        .collect();
    let listeners: Vec<_> = clients
        .iter()
        .map(|client| {
            let listener = CollectingListener::new();
            client.add_listener(listener.clone());
            listener
        })
        .collect();

    let event = MonitorEvent::Count { n: 7 };
    service.broadcast_event(&event);
    hub.run_until_idle();

    for listener in &listeners {
        assert_eq!(*listener.seen.borrow(), vec![event.clone()]);
    }
}

#[test]
fn test_listeners_fire_in_registration_order() {
    let hub = LoopbackHub::new();
    let (service, acceptor) = start_monitor::<MsgpackCodec>(&hub);
    let client = open_client::<MsgpackCodec>(&acceptor, &hub);

    struct OrderListener {
        tag: &'static str,
        order: Rc<RefCell<Vec<&'static str>>>,
    }
    impl EventListener<MonitorEvent> for OrderListener {
        fn on_service_event(&self, _event: MonitorEvent) {
            self.order.borrow_mut().push(self.tag);
        }
    }

    let order = Rc::new(RefCell::new(Vec::new()));
    client.add_listener(Rc::new(OrderListener {
        tag: "first",
        order: order.clone(),
    }));
    client.add_listener(Rc::new(OrderListener {
        tag: "second",
        order: order.clone(),
    }));

    service.broadcast_event(&MonitorEvent::Count { n: 1 });
    hub.run_until_idle();

    assert_eq!(*order.borrow(), vec!["first", "second"]);
}

#[test]
fn test_listener_removed_during_dispatch_still_receives_current_event() {
    let hub = LoopbackHub::new();
    let (service, acceptor) = start_monitor::<MsgpackCodec>(&hub);
    let client = Rc::new(open_client::<MsgpackCodec>(&acceptor, &hub));

    struct RemovingListener {
        client: Rc<Client<MsgpackCodec, MonitorEvent>>,
        victim: RefCell<Option<Rc<dyn EventListener<MonitorEvent>>>>,
        seen: RefCell<Vec<MonitorEvent>>,
    }
    impl EventListener<MonitorEvent> for RemovingListener {
        fn on_service_event(&self, event: MonitorEvent) {
            self.seen.borrow_mut().push(event);
            if let Some(victim) = self.victim.borrow_mut().take() {
                self.client.remove_listener(&victim);
            }
        }
    }

    let tail = CollectingListener::new();
    let remover = Rc::new(RemovingListener {
        client: client.clone(),
        victim: RefCell::new(None),
        seen: RefCell::new(Vec::new()),
    });
    client.add_listener(remover.clone());
    client.add_listener(tail.clone());
    *remover.victim.borrow_mut() = Some(tail.clone());

    service.broadcast_event(&MonitorEvent::Count { n: 1 });
    hub.run_until_idle();

    // The removed listener still saw the event being dispatched.
    assert_eq!(tail.seen.borrow().len(), 1);

    service.broadcast_event(&MonitorEvent::Count { n: 2 });
    hub.run_until_idle();

    // But not the next one.
    assert_eq!(tail.seen.borrow().len(), 1);
    assert_eq!(remover.seen.borrow().len(), 2);
}

#[test]
fn test_broadcast_skips_dead_session_but_reaches_the_rest() {
    let hub = LoopbackHub::new();
    let (service, acceptor) = start_monitor::<MsgpackCodec>(&hub);

    let doomed = open_client::<MsgpackCodec>(&acceptor, &hub);
    let survivor = open_client::<MsgpackCodec>(&acceptor, &hub);
    let listener = CollectingListener::new();
    survivor.add_listener(listener.clone());

    // Close one client; the service has not yet observed the disconnect
    // when it broadcasts.
    doomed.close();
    let event = MonitorEvent::Text {
        text: "still here".into(),
    };
    service.broadcast_event(&event);
    hub.run_until_idle();

    assert_eq!(*listener.seen.borrow(), vec![event]);
    assert_eq!(service.get_clients().len(), 1);
}
