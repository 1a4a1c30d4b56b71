// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process event bus owned by a session.
//!
//! Topics map to ordered handler lists; publishing runs handlers
//! sequentially in subscription order, which is what keeps bubbled
//! sub-agent events ordered.  Handlers must not publish back into the bus
//! during dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::SdkEvent;

type Handler = Arc<dyn Fn(&SdkEvent) + Send + Sync>;

#[derive(Default)]
pub struct SessionBus {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, handler: impl Fn(&SdkEvent) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn publish(&self, topic: &str, event: &SdkEvent) {
        // Handlers run outside the lock so a handler may subscribe, but the
        // dispatch list for this publish is the one captured at entry.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for h in &handlers {
            h(event);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .lock()
            .expect("bus lock poisoned")
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::StatusLevel;

    #[test]
    fn publish_reaches_all_subscribers_in_order() {
        let bus = SessionBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe("t", move |_| order.lock().unwrap().push(i));
        }
        bus.publish("t", &SdkEvent::status(StatusLevel::Info, "x"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn topics_are_isolated() {
        let bus = SessionBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe("a", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish("b", &SdkEvent::status(StatusLevel::Info, "x"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.publish("a", &SdkEvent::status(StatusLevel::Info, "x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = SessionBus::new();
        bus.publish("ghost", &SdkEvent::status(StatusLevel::Info, "x"));
        assert_eq!(bus.subscriber_count("ghost"), 0);
    }
}
