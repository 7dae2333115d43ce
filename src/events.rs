// =============================================================================
// Event bus — structured engine events for outer layers
// =============================================================================
//
// The core publishes onto an abstract sink; subscription layers (UI push,
// notifications) subscribe to the broadcast channel and are never called
// directly. Publishing never blocks and never fails: an event with no
// listeners is simply dropped.
// =============================================================================

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{ExecutionStatus, LiquidationEvent, OrderSide};

/// Everything the engine announces to the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    ExecutionStarted {
        symphony_id: String,
        user_id: String,
        window_date: NaiveDate,
    },
    OrderPlaced {
        symphony_id: String,
        client_order_id: String,
        ticker: String,
        side: OrderSide,
        qty: Decimal,
    },
    OrderFilled {
        symphony_id: String,
        client_order_id: String,
        ticker: String,
        filled_qty: Decimal,
        fill_price: Decimal,
    },
    SymphonyCompleted {
        symphony_id: String,
        status: ExecutionStatus,
    },
    Liquidation(LiquidationEvent),
}

/// Broadcast-backed event sink shared across workers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Channel capacity bounds how far a slow subscriber may lag before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        debug!(?event, "event published");
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::OrderPlaced {
            symphony_id: "s1".into(),
            client_order_id: "c1".into(),
            ticker: "SPY".into(),
            side: OrderSide::Buy,
            qty: dec!(10),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::OrderPlaced { ticker, qty, .. } => {
                assert_eq!(ticker, "SPY");
                assert_eq!(qty, dec!(10));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::SymphonyCompleted {
            symphony_id: "s1".into(),
            status: ExecutionStatus::Succeeded,
        });
    }

    #[test]
    fn events_serialise_with_kebab_case_tag() {
        let event = EngineEvent::ExecutionStarted {
            symphony_id: "s1".into(),
            user_id: "u1".into(),
            window_date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "execution-started");
    }
}
