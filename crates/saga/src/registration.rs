//! Explicit event-to-step routing for a saga.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::{Merge, SagaDriver, SagaEngine};
use crate::event::SagaEvent;
use crate::saga::Saga;
use crate::step::SagaStepId;

/// What an inbound event asks the owning saga to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Execute this step.
    Forward(SagaStepId),
    /// Compensate every executed step.
    Compensate,
}

#[derive(Debug, Clone)]
pub(crate) struct RouteSpec {
    pub(crate) type_id: TypeId,
    pub(crate) event_type: &'static str,
    pub(crate) direction: Direction,
}

/// A saga definition together with the events that drive it.
///
/// ```ignore
/// let registration = SagaRegistration::new(OrderSaga::new(inventory, payments))
///     .on::<OrderPlaced>("reserve_stock", |event, state| state.order_id = event.order_id.clone())
///     .on_step::<StockReserved>("charge_payment")
///     .on_step::<PaymentCharged>("confirm_order")
///     .compensate_on::<OrderCancelled>();
/// ```
pub struct SagaRegistration<S: Saga> {
    saga: S,
    routes: Vec<RouteSpec>,
    merges: HashMap<TypeId, Merge<S::State>>,
}

impl<S: Saga> SagaRegistration<S> {
    pub fn new(saga: S) -> Self {
        Self {
            saga,
            routes: Vec::new(),
            merges: HashMap::new(),
        }
    }

    /// Routes `E` to `step`. `merge` copies event data into the saga state
    /// before the step runs.
    pub fn on<E, F>(mut self, step: impl Into<SagaStepId>, merge: F) -> Self
    where
        E: SagaEvent,
        F: Fn(&E, &mut S::State) + Send + Sync + 'static,
    {
        let merge: Merge<S::State> =
            Arc::new(move |event: &(dyn Any + Send + Sync), state: &mut S::State| {
                if let Some(event) = event.downcast_ref::<E>() {
                    merge(event, state);
                }
            });
        self.merges.insert(TypeId::of::<E>(), merge);
        self.route::<E>(Direction::Forward(step.into()))
    }

    /// Routes `E` to `step` without touching the saga state.
    pub fn on_step<E: SagaEvent>(self, step: impl Into<SagaStepId>) -> Self {
        self.route::<E>(Direction::Forward(step.into()))
    }

    /// Routes `E` as a compensation request for the instance.
    pub fn compensate_on<E: SagaEvent>(self) -> Self {
        self.route::<E>(Direction::Compensate)
    }

    pub fn saga_type(&self) -> &'static str {
        self.saga.saga_type()
    }

    fn route<E: SagaEvent>(mut self, direction: Direction) -> Self {
        self.routes.push(RouteSpec {
            type_id: TypeId::of::<E>(),
            event_type: E::EVENT_TYPE,
            direction,
        });
        self
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn SagaDriver>, Vec<RouteSpec>) {
        let engine = SagaEngine::new(self.saga, self.merges);
        (Arc::new(engine), self.routes)
    }
}
