//! Order fulfillment: the demonstration saga run by the host.

pub mod events;
pub mod saga;
pub mod services;

pub use events::{OrderCancelled, OrderPlaced, PaymentCharged, StockReserved};
pub use saga::{OrderSaga, OrderSagaState};
pub use services::{
    InMemoryInventoryService, InMemoryPaymentService, InventoryService, OrderBook, OrderStatus,
    PaymentService, ServiceError,
};
