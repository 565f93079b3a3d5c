// Copyright The Flowmesh Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-publisher notification bus.
//!
//! The bus carries empty frames keyed by address string. One publisher binds
//! an address; any number of subscribers connect to it. Delivery is
//! per-publisher FIFO and lossy: a subscriber that falls behind observes
//! "news arrived", not every individual frame. Dedup and backpressure are
//! not provided.

use crate::error::Error;
use flowmesh_config::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Frames buffered per subscriber before lag kicks in.
const TOPIC_DEPTH: usize = 16;

struct Topic {
    tx: broadcast::Sender<()>,
    bound: bool,
}

/// Process-wide notification fabric, cloneable into every context.
#[derive(Clone, Default)]
pub struct NotifyBus {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl NotifyBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `addr` for publishing.
    ///
    /// # Errors
    ///
    /// [`Error::AddressAlreadyBound`] when another publisher holds the
    /// address; fatal to the offending node, per the resource-exhaustion
    /// policy.
    pub fn bind(&self, addr: &str) -> Result<BusPublisher, Error> {
        let mut topics = self.topics.lock();
        let topic = topics.entry(addr.to_owned()).or_insert_with(|| Topic {
            tx: broadcast::channel(TOPIC_DEPTH).0,
            bound: false,
        });
        if topic.bound {
            return Err(Error::AddressAlreadyBound {
                addr: addr.to_owned(),
            });
        }
        topic.bound = true;
        Ok(BusPublisher {
            addr: addr.to_owned(),
            tx: topic.tx.clone(),
            topics: self.topics.clone(),
        })
    }

    /// Connects a subscriber to `addr`. Subscribing before the publisher
    /// binds is allowed; frames sent before the subscription are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self, addr: &str) -> BusSubscriber {
        let mut topics = self.topics.lock();
        let topic = topics.entry(addr.to_owned()).or_insert_with(|| Topic {
            tx: broadcast::channel(TOPIC_DEPTH).0,
            bound: false,
        });
        BusSubscriber {
            addr: addr.to_owned(),
            rx: topic.tx.subscribe(),
        }
    }
}

/// The publishing end of one bus address.
pub struct BusPublisher {
    addr: String,
    tx: broadcast::Sender<()>,
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl BusPublisher {
    /// Sends one empty notification frame. A frame with no subscribers is
    /// dropped silently.
    pub fn send(&self) {
        let _ = self.tx.send(());
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for BusPublisher {
    fn drop(&mut self) {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(&self.addr) {
            topic.bound = false;
            if topic.tx.receiver_count() == 0 {
                let _ = topics.remove(&self.addr);
            }
        }
    }
}

/// The subscribing end of one bus address.
pub struct BusSubscriber {
    addr: String,
    rx: broadcast::Receiver<()>,
}

impl BusSubscriber {
    /// Awaits the next notification. Lag collapses into a single wake-up:
    /// any frame means "a new value has arrived".
    ///
    /// # Errors
    ///
    /// [`Error::NotificationLaneClosed`] when the topic was torn down.
    pub async fn recv(&mut self) -> Result<(), Error> {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
            Err(broadcast::error::RecvError::Closed) => Err(Error::NotificationLaneClosed {
                addr: self.addr.clone(),
            }),
        }
    }
}

/// Awaits the terminal notification of a finite emitter, which announces on
/// its own node id. Finished emitters re-announce every tick, so a late
/// listener still wakes up.
///
/// # Errors
///
/// [`Error::NotificationLaneClosed`] when the emitter's topic was torn down.
pub async fn await_terminal(bus: &NotifyBus, node: &NodeId) -> Result<(), Error> {
    bus.subscribe(node).recv().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn frames_reach_all_subscribers() {
        runtime().block_on(async {
            let bus = NotifyBus::new();
            let publisher = bus.bind("mc/p").expect("bind");
            let mut a = bus.subscribe("mc/p");
            let mut b = bus.subscribe("mc/p");

            publisher.send();
            a.recv().await.expect("a");
            b.recv().await.expect("b");
        });
    }

    #[test]
    fn double_bind_is_rejected_until_release() {
        let bus = NotifyBus::new();
        let publisher = bus.bind("mc/p").expect("bind");
        assert!(matches!(
            bus.bind("mc/p"),
            Err(Error::AddressAlreadyBound { .. })
        ));
        drop(publisher);
        assert!(bus.bind("mc/p").is_ok());
    }

    #[test]
    fn lag_collapses_into_one_wakeup() {
        runtime().block_on(async {
            let bus = NotifyBus::new();
            let publisher = bus.bind("mc/p").expect("bind");
            let mut sub = bus.subscribe("mc/p");
            for _ in 0..100 {
                publisher.send();
            }
            // Far past the topic depth; the subscriber still wakes.
            sub.recv().await.expect("lagged recv");
        });
    }

    #[test]
    fn early_subscription_sees_later_frames() {
        runtime().block_on(async {
            let bus = NotifyBus::new();
            let mut sub = bus.subscribe("mc/p");
            let publisher = bus.bind("mc/p").expect("bind");
            publisher.send();
            sub.recv().await.expect("recv");
        });
    }
}
