//! Inbound events driving the order saga.

use saga::SagaEvent;
use serde::{Deserialize, Serialize};
use state_store::SagaId;

/// A customer placed an order. Starts the saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
    pub card: String,
}

/// The warehouse acknowledged the reservation; payment may proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReserved {
    pub order_id: String,
}

/// The payment settled; the order may be confirmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCharged {
    pub order_id: String,
}

/// The customer cancelled the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

macro_rules! order_event {
    ($event:ty, $name:literal) => {
        impl SagaEvent for $event {
            const EVENT_TYPE: &'static str = $name;

            fn saga_id(&self) -> Option<SagaId> {
                Some(SagaId::from(self.order_id.as_str()))
            }
        }
    };
}

order_event!(OrderPlaced, "OrderPlaced");
order_event!(StockReserved, "StockReserved");
order_event!(PaymentCharged, "PaymentCharged");
order_event!(OrderCancelled, "OrderCancelled");
