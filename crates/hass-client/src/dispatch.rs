//! Event fan-out to registered listeners.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use hass_wire::{EventMessage, EventResultInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::subscriptions::SubscriptionRegistry;

/// Drain the event queue, parsing each body and invoking the listeners
/// registered under the event's subscription id.
///
/// Runs on its own task so listener work never blocks the socket reader.
/// A panicking listener is contained and logged; remaining listeners still
/// run.
pub(crate) async fn run_dispatch(
    mut events_rx: mpsc::UnboundedReceiver<EventMessage>,
    registry: Arc<SubscriptionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            // Cancellation wins over buffered events.
            biased;
            () = cancel.cancelled() => break,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let info: EventResultInfo = match event.deserialize_event() {
            Ok(info) => info,
            Err(err) => {
                warn!(id = event.id, error = %err, "skipping malformed event body");
                continue;
            }
        };
        let callbacks = registry.listeners_for(event.id, &info.event_type);
        if callbacks.is_empty() {
            debug!(id = event.id, event_type = %info.event_type, "event without listeners");
            continue;
        }
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                warn!(event_type = %info.event_type, "event listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::Topic;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(id: u64, event_type: &str) -> EventMessage {
        EventMessage {
            id,
            event: json!({
                "event_type": event_type,
                "time_fired": "2024-01-01T00:00:00+00:00",
                "origin": "LOCAL",
                "data": {},
            }),
        }
    }

    fn recording(seen: &Arc<Mutex<Vec<String>>>) -> crate::subscriptions::EventCallback {
        let seen = Arc::clone(seen);
        Arc::new(move |info| seen.lock().push(info.event_type.clone()))
    }

    #[tokio::test]
    async fn dispatches_to_matching_listener() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.insert_topic(
            Topic::Event("state_changed".into()),
            5,
            recording(&seen),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(event(5, "state_changed")).unwrap();
        drop(tx);
        run_dispatch(rx, registry, CancellationToken::new()).await;

        assert_eq!(*seen.lock(), vec!["state_changed".to_owned()]);
    }

    #[tokio::test]
    async fn stale_subscription_id_is_ignored() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.insert_topic(
            Topic::Event("state_changed".into()),
            5,
            recording(&seen),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(event(9, "state_changed")).unwrap();
        drop(tx);
        run_dispatch(rx, registry, CancellationToken::new()).await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_event_body_is_skipped() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.insert_topic(Topic::Any, 3, recording(&seen));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(EventMessage {
            id: 3,
            event: json!({"event_type": "broken"}),
        })
        .unwrap();
        tx.send(event(3, "intact")).unwrap();
        drop(tx);
        run_dispatch(rx, registry, CancellationToken::new()).await;

        assert_eq!(*seen.lock(), vec!["intact".to_owned()]);
    }

    #[tokio::test]
    async fn listener_panic_does_not_stop_dispatch() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let topic = Topic::Event("state_changed".into());
        let _ = registry.insert_topic(topic.clone(), 5, Arc::new(|_| panic!("listener bug")));
        let _ = registry.add_local(&topic, recording(&seen)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(event(5, "state_changed")).unwrap();
        tx.send(event(5, "state_changed")).unwrap();
        drop(tx);
        run_dispatch(rx, registry, CancellationToken::new()).await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_drain() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = registry.insert_topic(Topic::Any, 1, recording(&seen));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(event(1, "state_changed")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_dispatch(rx, registry, cancel).await;

        assert!(seen.lock().is_empty());
    }
}
