//! Channel Router
//!
//! Publish/subscribe registry keyed by lowercased channel name. The wildcard
//! channel `*` receives every envelope. Fan-out iterates over a snapshot of
//! the listeners taken before delivery, so listeners may subscribe or
//! unsubscribe from inside a callback.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::protocol::Envelope;

/// Channel that receives every envelope
pub const WILDCARD_CHANNEL: &str = "*";

/// Channel carrying alert notifications
pub const ALERTS_CHANNEL: &str = "alerts";

/// Channel carrying cache invalidation events
pub const EVENTS_CHANNEL: &str = "events";

/// Callback invoked for each matching envelope
pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct Subscription {
    id: u64,
    events: Option<HashSet<String>>,
    listener: Listener,
}

impl Subscription {
    fn accepts(&self, event_key: &str) -> bool {
        self.events
            .as_ref()
            .map_or(true, |events| events.contains(event_key))
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, Vec<Arc<Subscription>>>,
}

/// Pub/sub registry shared by the connection manager and its collaborators
#[derive(Clone, Default)]
pub struct ChannelRouter {
    registry: Arc<RwLock<Registry>>,
}

/// Ends a subscription when `unsubscribe` is called
///
/// Dropping the handle leaves the subscription in place.
#[must_use = "the subscription stays active until unsubscribe() is called"]
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    channel_key: String,
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl SubscriptionHandle {
    /// Remove the subscription; further calls are no-ops
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.write();
        if let Some(bucket) = registry.channels.get_mut(&self.channel_key) {
            bucket.retain(|subscription| subscription.id != self.id);
            if bucket.is_empty() {
                registry.channels.remove(&self.channel_key);
            }
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel_key
    }
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event on a channel
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(channel, None, Arc::new(listener))
    }

    /// Subscribe to the listed events on a channel
    pub fn subscribe_filtered<I, S, F>(&self, channel: &str, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(channel, Some(event_filter(events)), Arc::new(listener))
    }

    /// Subscribe to every envelope regardless of channel
    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(WILDCARD_CHANNEL, None, Arc::new(listener))
    }

    /// Subscribe to the listed events on every channel
    pub fn subscribe_all_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(WILDCARD_CHANNEL, Some(event_filter(events)), Arc::new(listener))
    }

    pub fn subscribe_alerts<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(ALERTS_CHANNEL, listener)
    }

    pub fn subscribe_events<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(EVENTS_CHANNEL, listener)
    }

    pub fn subscribe_alerts_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_filtered(ALERTS_CHANNEL, events, listener)
    }

    pub fn subscribe_events_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_filtered(EVENTS_CHANNEL, events, listener)
    }

    fn register(
        &self,
        channel: &str,
        events: Option<HashSet<String>>,
        listener: Listener,
    ) -> SubscriptionHandle {
        let channel_key = channel.to_lowercase();
        let mut registry = self.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .channels
            .entry(channel_key.clone())
            .or_default()
            .push(Arc::new(Subscription {
                id,
                events,
                listener,
            }));
        debug!("Subscribed #{} to channel '{}'", id, channel_key);

        SubscriptionHandle {
            channel_key,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an envelope to matching channel and wildcard listeners
    ///
    /// Returns the number of listeners that ran to completion. A panicking
    /// listener is logged and skipped.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let channel_key = envelope.channel_key();
        let event_key = envelope.event_key();

        let snapshot: Vec<Arc<Subscription>> = {
            let registry = self.registry.read();
            let mut snapshot = Vec::new();
            if let Some(bucket) = registry.channels.get(&channel_key) {
                snapshot.extend(bucket.iter().cloned());
            }
            if channel_key != WILDCARD_CHANNEL {
                if let Some(bucket) = registry.channels.get(WILDCARD_CHANNEL) {
                    snapshot.extend(bucket.iter().cloned());
                }
            }
            snapshot
        };

        let mut delivered = 0;
        for subscription in snapshot.iter().filter(|s| s.accepts(&event_key)) {
            let listener = &subscription.listener;
            match catch_unwind(AssertUnwindSafe(|| listener(envelope))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    "Listener #{} panicked on {}/{}",
                    subscription.id, envelope.channel, envelope.event
                ),
            }
        }
        delivered
    }

    /// Channel keys that currently have at least one listener
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.registry.read().channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Number of listeners registered on a channel (exact key, no wildcard)
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .read()
            .channels
            .get(&channel.to_lowercase())
            .map_or(0, Vec::len)
    }
}

fn event_filter<I, S>(events: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    events
        .into_iter()
        .map(|event| event.as_ref().to_lowercase())
        .collect()
}
