//! Collaborators the order saga calls, with in-memory implementations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use pipeline::{BoxError, Transaction, UnitOfWork};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the order collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Insufficient stock for {sku}: requested {requested}, available {available}")]
    InsufficientStock {
        sku: String,
        requested: u32,
        available: u32,
    },

    #[error("Card declined")]
    CardDeclined,

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Business refusals are final; anything else may succeed on retry.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ServiceError::InsufficientStock { .. } | ServiceError::CardDeclined
        )
    }
}

/// Stock reservations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves `quantity` units of `sku` for an order. Returns the reservation id.
    async fn reserve(
        &self,
        order_id: &str,
        sku: &str,
        quantity: u32,
    ) -> Result<String, ServiceError>;

    /// Releases a reservation. Releasing an unknown reservation is a no-op.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

/// Card payments.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a card for an order. Returns the payment id.
    async fn charge(
        &self,
        order_id: &str,
        card: &str,
        amount_cents: u64,
    ) -> Result<String, ServiceError>;

    /// Refunds a previous charge. Refunding an unknown payment is a no-op.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<String, u32>,
    reservations: HashMap<String, (String, u32)>,
    next_id: u32,
}

/// In-memory inventory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `quantity` units of `sku` to the shelf.
    pub fn with_stock(self, sku: impl Into<String>, quantity: u32) -> Self {
        self.restock(sku, quantity);
        self
    }

    pub fn restock(&self, sku: impl Into<String>, quantity: u32) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state.stock.entry(sku.into()).or_default() += quantity;
    }

    /// Units of `sku` not held by a reservation.
    pub fn available(&self, sku: &str) -> u32 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.stock.get(sku).copied().unwrap_or(0)
    }

    pub fn reservation_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.reservations.len()
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: &str,
        sku: &str,
        quantity: u32,
    ) -> Result<String, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let available = state.stock.get(sku).copied().unwrap_or(0);
        if available < quantity {
            return Err(ServiceError::InsufficientStock {
                sku: sku.to_string(),
                requested: quantity,
                available,
            });
        }
        state.stock.insert(sku.to_string(), available - quantity);

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (sku.to_string(), quantity));

        tracing::debug!(order_id, sku, quantity, %reservation_id, "stock reserved");
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((sku, quantity)) = state.reservations.remove(reservation_id) {
            *state.stock.entry(sku).or_default() += quantity;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PaymentState {
    payments: HashMap<String, (String, u64)>,
    declined_cards: HashSet<String>,
    next_id: u32,
    fail_on_charge: bool,
}

/// In-memory payment gateway.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<PaymentState>>,
}

impl InMemoryPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every future charge against `card`.
    pub fn decline_card(self, card: impl Into<String>) -> Self {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .declined_cards
            .insert(card.into());
        self
    }

    /// Makes every charge fail as if the gateway were down.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_charge = fail;
    }

    pub fn payment_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.payments.len()
    }

    pub fn has_payment(&self, payment_id: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.payments.contains_key(payment_id)
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        order_id: &str,
        card: &str,
        amount_cents: u64,
    ) -> Result<String, ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.fail_on_charge {
            return Err(ServiceError::Unavailable("payment gateway".to_string()));
        }
        if state.declined_cards.contains(card) {
            return Err(ServiceError::CardDeclined);
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .payments
            .insert(payment_id.clone(), (order_id.to_string(), amount_cents));

        Ok(payment_id)
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.payments.remove(payment_id);
        Ok(())
    }
}

/// Lifecycle of an order as the host's own records see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    StockReserved,
    Paid,
    Confirmed,
    Cancelled,
}

/// The host's record of orders, written by the saga steps.
///
/// Also the unit of work for inbound dispatch: a transaction snapshots the book
/// and a rollback restores the snapshot. The inbound adapter dispatches one
/// message at a time, so a whole-book snapshot is a consistent savepoint.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    orders: Arc<RwLock<HashMap<String, OrderStatus>>>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, order_id: &str, status: OrderStatus) {
        self.orders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id.to_string(), status);
    }

    pub fn status(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct OrderBookTransaction {
    book: OrderBook,
    snapshot: HashMap<String, OrderStatus>,
}

#[async_trait]
impl UnitOfWork for OrderBook {
    async fn begin(&self) -> Result<Box<dyn Transaction>, BoxError> {
        let snapshot = self
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Box::new(OrderBookTransaction {
            book: self.clone(),
            snapshot,
        }))
    }
}

#[async_trait]
impl Transaction for OrderBookTransaction {
    async fn commit(self: Box<Self>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BoxError> {
        *self
            .book
            .orders
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.snapshot;
        tracing::debug!("order book rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let inventory = InMemoryInventoryService::new().with_stock("SKU-1", 5);

        let reservation = inventory.reserve("order-1", "SKU-1", 3).await.unwrap();
        assert_eq!(reservation, "RES-0001");
        assert_eq!(inventory.available("SKU-1"), 2);

        inventory.release(&reservation).await.unwrap();
        assert_eq!(inventory.available("SKU-1"), 5);
        assert_eq!(inventory.reservation_count(), 0);

        inventory.release(&reservation).await.unwrap();
        assert_eq!(inventory.available("SKU-1"), 5);
    }

    #[tokio::test]
    async fn test_reserve_insufficient_stock() {
        let inventory = InMemoryInventoryService::new().with_stock("SKU-1", 1);

        let err = inventory.reserve("order-1", "SKU-1", 2).await.unwrap_err();
        assert_eq!(
            err,
            ServiceError::InsufficientStock {
                sku: "SKU-1".to_string(),
                requested: 2,
                available: 1
            }
        );
        assert!(err.is_refusal());
        assert_eq!(inventory.available("SKU-1"), 1);
    }

    #[tokio::test]
    async fn test_charge_and_refund() {
        let payments = InMemoryPaymentService::new();

        let payment_id = payments.charge("order-1", "4242", 5000).await.unwrap();
        assert!(payment_id.starts_with("PAY-"));
        assert!(payments.has_payment(&payment_id));

        payments.refund(&payment_id).await.unwrap();
        assert_eq!(payments.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_declined_card() {
        let payments = InMemoryPaymentService::new().decline_card("0002");

        let err = payments.charge("order-1", "0002", 5000).await.unwrap_err();
        assert_eq!(err, ServiceError::CardDeclined);
        assert_eq!(payments.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_outage_is_not_a_refusal() {
        let payments = InMemoryPaymentService::new();
        payments.set_fail_on_charge(true);

        let err = payments.charge("order-1", "4242", 5000).await.unwrap_err();
        assert!(!err.is_refusal());
    }

    #[tokio::test]
    async fn test_sequential_payment_ids() {
        let payments = InMemoryPaymentService::new();

        let first = payments.charge("order-1", "4242", 1000).await.unwrap();
        let second = payments.charge("order-2", "4242", 1000).await.unwrap();

        assert_eq!(first, "PAY-0001");
        assert_eq!(second, "PAY-0002");
    }

    #[tokio::test]
    async fn test_order_book_rollback_restores_snapshot() {
        let book = OrderBook::new();
        book.record("order-1", OrderStatus::StockReserved);

        let tx = book.begin().await.unwrap();
        book.record("order-1", OrderStatus::Paid);
        book.record("order-2", OrderStatus::StockReserved);
        tx.rollback().await.unwrap();

        assert_eq!(book.status("order-1"), Some(OrderStatus::StockReserved));
        assert_eq!(book.status("order-2"), None);

        let tx = book.begin().await.unwrap();
        book.record("order-1", OrderStatus::Paid);
        tx.commit().await.unwrap();
        assert_eq!(book.status("order-1"), Some(OrderStatus::Paid));
    }
}
