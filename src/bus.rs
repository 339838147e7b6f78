//! In-process event bus connecting the profiler to the detection modules.
//!
//! Topics are a closed set; payloads are pre-serialised JSON strings so that
//! subscribers decode exactly what an external transport would deliver. Each
//! subscription gets its own unbounded channel, which gives every detection
//! module blocking receive, per-subscriber arrival order, and no shared
//! mutable state between modules.
//!
//! A stop is a distinct message, not a payload convention: [`Bus::stop`] fans
//! a [`BusMessage::Stop`] out to every subscriber exactly once.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The event topics a detection module can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// An ARP record was profiled; payload is the serialised ARP event.
    NewArp,
    /// A time window was closed; payload is the combined `profileid_twid` key.
    WindowClosed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NewArp       => "new_arp",
            Topic::WindowClosed => "window_closed",
        }
    }
}

/// A message delivered to a subscription channel.
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// A payload published on one of the subscribed topics.
    Event { topic: Topic, payload: String },
    /// Terminal control signal: finish pending work and return.
    Stop,
}

/// Topic-based publish/subscribe hub.
pub struct Bus {
    /// Per-topic subscriber senders.
    topics: Mutex<HashMap<Topic, Vec<Sender<BusMessage>>>>,
    /// Every subscriber sender, for stop fan-out.
    all:    Mutex<Vec<Sender<BusMessage>>>,
}

pub type SharedBus = Arc<Bus>;

impl Bus {
    pub fn new() -> SharedBus {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            all:    Mutex::new(Vec::new()),
        })
    }

    /// Registers a new subscriber for the given topics and returns its
    /// receiving end. One channel per subscriber: messages for all of its
    /// topics arrive in publication order on the same receiver.
    pub fn subscribe(&self, topics: &[Topic]) -> Receiver<BusMessage> {
        let (tx, rx) = unbounded();
        if let Ok(mut map) = self.topics.lock() {
            for topic in topics {
                map.entry(*topic).or_default().push(tx.clone());
            }
        }
        if let Ok(mut all) = self.all.lock() {
            all.push(tx);
        }
        rx
    }

    /// Delivers a payload to every subscriber of `topic`.
    ///
    /// Send failures mean the subscriber already hung up; those are dropped
    /// silently rather than treated as publisher errors.
    pub fn publish(&self, topic: Topic, payload: String) {
        if let Ok(map) = self.topics.lock() {
            if let Some(subs) = map.get(&topic) {
                for tx in subs {
                    let _ = tx.send(BusMessage::Event {
                        topic,
                        payload: payload.clone(),
                    });
                }
            }
        }
    }

    /// Fans a terminal [`BusMessage::Stop`] out to every subscriber.
    pub fn stop(&self) {
        if let Ok(all) = self.all.lock() {
            for tx in all.iter() {
                let _ = tx.send(BusMessage::Stop);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_routes_only_to_subscribed_topics() {
        let bus = Bus::new();
        let arp_only = bus.subscribe(&[Topic::NewArp]);
        let both     = bus.subscribe(&[Topic::NewArp, Topic::WindowClosed]);

        bus.publish(Topic::WindowClosed, "profile|10.0.0.5_tw1".into());
        bus.publish(Topic::NewArp, "{}".into());

        // The arp-only subscriber sees just the ARP event.
        match arp_only.try_recv() {
            Ok(BusMessage::Event { topic, .. }) => assert_eq!(topic, Topic::NewArp),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(arp_only.try_recv().is_err());

        // The dual subscriber sees both, in publication order.
        match both.try_recv() {
            Ok(BusMessage::Event { topic, payload }) => {
                assert_eq!(topic, Topic::WindowClosed);
                assert_eq!(payload, "profile|10.0.0.5_tw1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match both.try_recv() {
            Ok(BusMessage::Event { topic, .. }) => assert_eq!(topic, Topic::NewArp),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn stop_reaches_every_subscriber() {
        let bus = Bus::new();
        let a = bus.subscribe(&[Topic::NewArp]);
        let b = bus.subscribe(&[Topic::WindowClosed]);

        bus.stop();

        assert!(matches!(a.try_recv(), Ok(BusMessage::Stop)));
        assert!(matches!(b.try_recv(), Ok(BusMessage::Stop)));
    }
}
