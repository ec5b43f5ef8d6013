//! In-process publish/subscribe fan-out for change events.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, mpsc};

use tracing::warn;

use recordguard_core::{RecordId, SubscriptionId};

use crate::event::ChangeEvent;
use crate::subscription::Subscription;

/// `true` keeps the subscriber registered, `false` drops it.
type Callback = Box<dyn Fn(&ChangeEvent) -> bool + Send>;

struct Subscriber {
    id: SubscriptionId,
    table: String,
    record_id: Option<RecordId>,
    callback: Callback,
}

impl Subscriber {
    fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.record_id.map_or(true, |id| id == event.record_id)
    }
}

/// Scoped pub/sub registry.
///
/// - `subscribe` with `record_id = None` receives every event for the table.
/// - Delivery is best-effort, at-most-once, no replay: subscribers only see
///   events published while they are registered.
/// - The registry mutex is held for the whole delivery pass, so once
///   `unsubscribe` returns the removed callback can no longer be invoked:
///   any racing `publish` either finished delivering before the removal or
///   never sees the entry.
/// - A panicking callback is caught, logged and dropped without affecting
///   the other subscribers.
/// - Callbacks run under the registry lock and therefore must not call back
///   into the notifier (subscribe/unsubscribe/publish). Hand the event to a
///   channel (`subscribe_channel`) when the consumer needs to react with
///   further engine calls.
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for a table, optionally narrowed to one record.
    pub fn subscribe<F>(
        &self,
        table: impl Into<String>,
        record_id: Option<RecordId>,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + 'static,
    {
        self.subscribe_retained(table, record_id, move |event| {
            callback(event);
            true
        })
    }

    /// Register a channel-backed subscription. The sender side is dropped
    /// automatically once the `Subscription` receiver is gone.
    pub fn subscribe_channel(
        &self,
        table: impl Into<String>,
        record_id: Option<RecordId>,
    ) -> (SubscriptionId, Subscription<ChangeEvent>) {
        let (tx, rx) = mpsc::channel();
        let id = self.subscribe_retained(table, record_id, move |event| {
            tx.send(event.clone()).is_ok()
        });
        (id, Subscription::new(rx))
    }

    fn subscribe_retained<F>(
        &self,
        table: impl Into<String>,
        record_id: Option<RecordId>,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) -> bool + Send + 'static,
    {
        let id = SubscriptionId::new();
        let subscriber = Subscriber {
            id,
            table: table.into(),
            record_id,
            callback: Box::new(callback),
        };

        // If the lock is poisoned we still hand out an id; the subscription
        // just never receives anything (delivery is best-effort).
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(subscriber);
        } else {
            warn!(subscription = %id, "subscriber registry poisoned, subscription inert");
        }

        id
    }

    /// Remove a subscription. Idempotent: unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|s| s.id != id);
        }
    }

    /// Deliver an event to every matching subscriber, in subscription order.
    pub fn publish(&self, event: &ChangeEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            warn!(table = %event.table, "subscriber registry poisoned, event dropped");
            return;
        };

        subs.retain(|sub| {
            if !sub.matches(event) {
                return true;
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(alive) => alive,
                Err(_) => {
                    warn!(
                        subscription = %sub.id,
                        table = %event.table,
                        "subscriber panicked, dropping it"
                    );
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use recordguard_core::{RecordScope, UserId};

    fn session_event(table: &str, record_id: RecordId) -> ChangeEvent {
        let scope = RecordScope::new(table, record_id);
        ChangeEvent::session_started(&scope, UserId::new(), "editing")
    }

    #[test]
    fn wildcard_subscription_sees_all_records_of_the_table() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        notifier.subscribe("orders", None, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(&session_event("orders", RecordId::new()));
        notifier.publish(&session_event("orders", RecordId::new()));
        notifier.publish(&session_event("estimates", RecordId::new()));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn record_scoped_subscription_filters_other_records() {
        let notifier = ChangeNotifier::new();
        let target = RecordId::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        notifier.subscribe("orders", Some(target), move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(&session_event("orders", target));
        notifier.publish(&session_event("orders", RecordId::new()));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_stops_delivery() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let id = notifier.subscribe("orders", None, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.unsubscribe(id);
        notifier.unsubscribe(id);
        notifier.publish(&session_event("orders", RecordId::new()));

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn channel_subscription_receives_events() {
        let notifier = ChangeNotifier::new();
        let (_id, sub) = notifier.subscribe_channel("orders", None);

        let record_id = RecordId::new();
        notifier.publish(&session_event("orders", record_id));

        let event = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.record_id, record_id);
    }

    #[test]
    fn dropped_channel_receiver_is_pruned_on_publish() {
        let notifier = ChangeNotifier::new();
        let (_id, sub) = notifier.subscribe_channel("orders", None);
        drop(sub);

        notifier.publish(&session_event("orders", RecordId::new()));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[test]
    fn panicking_subscriber_is_isolated_and_dropped() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        notifier.subscribe("orders", None, |_| panic!("boom"));
        notifier.subscribe("orders", None, move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(&session_event("orders", RecordId::new()));
        notifier.publish(&session_event("orders", RecordId::new()));

        // The healthy subscriber saw both events; the panicking one is gone.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn no_delivery_after_unsubscribe_returns_under_racing_publishes() {
        let notifier = Arc::new(ChangeNotifier::new());
        let delivered_after_removal = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let counter = delivered_after_removal.clone();
        let removed_flag = removed.clone();
        let id = notifier.subscribe("orders", None, move |_| {
            if removed_flag.load(Ordering::SeqCst) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let publisher = {
            let notifier = notifier.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    notifier.publish(&session_event("orders", RecordId::new()));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        notifier.unsubscribe(id);
        // The registry lock orders this store after any in-flight delivery.
        removed.store(true, Ordering::SeqCst);

        publisher.join().unwrap();
        assert_eq!(delivered_after_removal.load(Ordering::SeqCst), 0);
    }
}
