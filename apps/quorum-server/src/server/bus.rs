use tokio::sync::broadcast;

use super::gateway_events::GatewayEvent;

/// One event in flight on the fan-out bus. `payload` is the serialized
/// envelope exactly as it goes to sockets; relays never re-encode.
#[derive(Debug, Clone)]
pub(crate) struct BusMessage {
    pub(crate) topic: &'static str,
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("fan-out bus is unavailable")]
pub(crate) struct BusUnavailable;

/// Cross-process publish/subscribe seam. Guarantees at-least-once
/// delivery to every attached relay and total order per publisher on a
/// topic; nothing is ordered across publishers and nothing is replayed
/// after an outage. A publish with no attached relay reports
/// [`BusUnavailable`] so callers can degrade to same-process delivery.
#[derive(Clone, Debug)]
pub(crate) struct FanoutBus {
    tx: broadcast::Sender<BusMessage>,
}

impl FanoutBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event on a room topic. Returns the number of relays
    /// that will observe it.
    ///
    /// # Errors
    /// Returns [`BusUnavailable`] when no relay is subscribed.
    pub(crate) fn publish(
        &self,
        topic: &'static str,
        event: &GatewayEvent,
    ) -> Result<usize, BusUnavailable> {
        self.tx
            .send(BusMessage {
                topic,
                event_type: event.event_type,
                payload: event.payload.clone(),
            })
            .map_err(|_| BusUnavailable)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::{BusUnavailable, FanoutBus};
    use crate::server::gateway_events::GatewayEvent;

    fn event(payload: &str) -> GatewayEvent {
        GatewayEvent {
            event_type: "message:new",
            payload: payload.to_owned(),
        }
    }

    #[test]
    fn publish_without_relay_reports_unavailable() {
        let bus = FanoutBus::new(8);
        assert_eq!(bus.publish("global", &event("{}")), Err(BusUnavailable));
    }

    #[tokio::test]
    async fn subscribed_relay_receives_published_events_in_order() {
        let bus = FanoutBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish("global", &event("first")).unwrap();
        bus.publish("global", &event("second")).unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, "first");
        assert_eq!(rx.recv().await.unwrap().payload, "second");
    }

    #[tokio::test]
    async fn every_relay_observes_every_publish() {
        let bus = FanoutBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish("members", &event("{}")).unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await.unwrap().topic, "members");
        assert_eq!(second.recv().await.unwrap().topic, "members");
    }
}
