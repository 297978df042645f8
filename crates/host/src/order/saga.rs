//! The order fulfillment saga: reserve stock, charge payment, confirm.

use std::sync::Arc;

use async_trait::async_trait;
use saga::{Saga, SagaContext, SagaRegistration, SagaStepId, StepError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::events::{OrderCancelled, OrderPlaced, PaymentCharged, StockReserved};
use super::services::{InventoryService, OrderBook, OrderStatus, PaymentService, ServiceError};

pub const RESERVE_STOCK: &str = "reserve_stock";
pub const CHARGE_PAYMENT: &str = "charge_payment";
pub const CONFIRM_ORDER: &str = "confirm_order";

/// Persisted state of one order saga.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSagaState {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
    pub card: String,
    pub reservation_id: Option<String>,
    pub payment_id: Option<String>,
}

pub struct OrderSaga {
    inventory: Arc<dyn InventoryService>,
    payments: Arc<dyn PaymentService>,
    orders: OrderBook,
}

impl OrderSaga {
    pub const SAGA_TYPE: &'static str = "OrderFulfillment";

    pub fn new(
        inventory: Arc<dyn InventoryService>,
        payments: Arc<dyn PaymentService>,
        orders: OrderBook,
    ) -> Self {
        Self {
            inventory,
            payments,
            orders,
        }
    }

    /// The saga together with the events that drive it.
    pub fn registration(self) -> SagaRegistration<Self> {
        SagaRegistration::new(self)
            .on::<OrderPlaced, _>(RESERVE_STOCK, |event, state| {
                state.order_id = event.order_id.clone();
                state.sku = event.sku.clone();
                state.quantity = event.quantity;
                state.amount_cents = event.amount_cents;
                state.card = event.card.clone();
            })
            .on_step::<StockReserved>(CHARGE_PAYMENT)
            .on_step::<PaymentCharged>(CONFIRM_ORDER)
            .compensate_on::<OrderCancelled>()
    }
}

fn step_error(error: ServiceError) -> StepError {
    if error.is_refusal() {
        StepError::rejected(error.to_string())
    } else {
        StepError::failed(error)
    }
}

#[async_trait]
impl Saga for OrderSaga {
    type State = OrderSagaState;

    fn saga_type(&self) -> &'static str {
        Self::SAGA_TYPE
    }

    fn steps(&self) -> Vec<SagaStepId> {
        vec![
            RESERVE_STOCK.into(),
            CHARGE_PAYMENT.into(),
            CONFIRM_ORDER.into(),
        ]
    }

    async fn execute(
        &self,
        ctx: &mut SagaContext<OrderSagaState>,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let step = ctx.step_id().clone();
        let state = ctx.state_mut();
        match step.as_str() {
            RESERVE_STOCK => {
                let reservation_id = self
                    .inventory
                    .reserve(&state.order_id, &state.sku, state.quantity)
                    .await
                    .map_err(step_error)?;
                state.reservation_id = Some(reservation_id);
                self.orders.record(&state.order_id, OrderStatus::StockReserved);
            }
            CHARGE_PAYMENT => {
                let payment_id = self
                    .payments
                    .charge(&state.order_id, &state.card, state.amount_cents)
                    .await
                    .map_err(step_error)?;
                state.payment_id = Some(payment_id);
                self.orders.record(&state.order_id, OrderStatus::Paid);
            }
            CONFIRM_ORDER => {
                self.orders.record(&state.order_id, OrderStatus::Confirmed);
                tracing::info!(order_id = %state.order_id, "order confirmed");
            }
            other => return Err(StepError::rejected(format!("unknown step '{other}'"))),
        }
        Ok(())
    }

    async fn compensate(
        &self,
        ctx: &mut SagaContext<OrderSagaState>,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let step = ctx.step_id().clone();
        let state = ctx.state_mut();
        match step.as_str() {
            RESERVE_STOCK => {
                if let Some(reservation_id) = state.reservation_id.take() {
                    self.inventory
                        .release(&reservation_id)
                        .await
                        .map_err(StepError::failed)?;
                }
                self.orders.record(&state.order_id, OrderStatus::Cancelled);
            }
            CHARGE_PAYMENT => {
                if let Some(payment_id) = state.payment_id.take() {
                    self.payments
                        .refund(&payment_id)
                        .await
                        .map_err(StepError::failed)?;
                }
            }
            CONFIRM_ORDER => {
                self.orders.record(&state.order_id, OrderStatus::Paid);
            }
            other => return Err(StepError::rejected(format!("unknown step '{other}'"))),
        }
        Ok(())
    }
}
