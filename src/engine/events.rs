// src/engine/events.rs

//! Typed publish/subscribe bus for model lifecycle events.
//!
//! Delivery is synchronous on the publishing thread. Handlers run in
//! registration order; kind-specific and catch-all subscribers share one
//! ordering. A handler that returns an error or panics is logged and the
//! remaining handlers still receive the event.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{error, trace, warn};

use crate::engine::record::{ExecutionStatus, SkipCause};
use crate::types::ModelId;

/// Discriminant of [`ModelEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModelStarted,
    ModelCompleted,
    ModelFailed,
    ModelSkipped,
    ModelCancelled,
    DependencyReady,
    DependencyFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Resources were allocated and the model was handed to its runner.
    ModelStarted { model: ModelId, at: DateTime<Utc> },
    ModelCompleted {
        model: ModelId,
        row_count: u64,
        at: DateTime<Utc>,
    },
    ModelFailed {
        model: ModelId,
        error: String,
        at: DateTime<Utc>,
    },
    ModelSkipped {
        model: ModelId,
        cause: SkipCause,
        at: DateTime<Utc>,
    },
    ModelCancelled { model: ModelId, at: DateTime<Utc> },
    /// Every declared dependency of `model` passed validation.
    DependencyReady { model: ModelId, at: DateTime<Utc> },
    /// `dependency` of `model` failed validation.
    DependencyFailed {
        model: ModelId,
        dependency: ModelId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl ModelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ModelEvent::ModelStarted { .. } => EventKind::ModelStarted,
            ModelEvent::ModelCompleted { .. } => EventKind::ModelCompleted,
            ModelEvent::ModelFailed { .. } => EventKind::ModelFailed,
            ModelEvent::ModelSkipped { .. } => EventKind::ModelSkipped,
            ModelEvent::ModelCancelled { .. } => EventKind::ModelCancelled,
            ModelEvent::DependencyReady { .. } => EventKind::DependencyReady,
            ModelEvent::DependencyFailed { .. } => EventKind::DependencyFailed,
        }
    }

    /// The model the event is about.
    pub fn model(&self) -> &str {
        match self {
            ModelEvent::ModelStarted { model, .. }
            | ModelEvent::ModelCompleted { model, .. }
            | ModelEvent::ModelFailed { model, .. }
            | ModelEvent::ModelSkipped { model, .. }
            | ModelEvent::ModelCancelled { model, .. }
            | ModelEvent::DependencyReady { model, .. }
            | ModelEvent::DependencyFailed { model, .. } => model,
        }
    }

    /// Terminal status announced by this event, if it is a terminal event.
    pub fn terminal_status(&self) -> Option<ExecutionStatus> {
        match self {
            ModelEvent::ModelCompleted { .. } => Some(ExecutionStatus::Succeeded),
            ModelEvent::ModelFailed { .. } => Some(ExecutionStatus::Failed),
            ModelEvent::ModelSkipped { .. } => Some(ExecutionStatus::Skipped),
            ModelEvent::ModelCancelled { .. } => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Handle returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ModelEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

/// Cloneable event bus; clones share the same subscriber registry.
#[derive(Clone, Default)]
pub struct EventCoordinator {
    inner: Arc<RwLock<Registry>>,
}

impl fmt::Debug for EventCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCoordinator")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one kind of event.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ModelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ModelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let mut registry = self.inner.write();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscriptions.push(Subscription { id, kind, handler });
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.write();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != id);
        registry.subscriptions.len() != before
    }

    pub fn clear(&self) {
        self.inner.write().subscriptions.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// The registry lock is released before any handler runs, so handlers
    /// may subscribe, unsubscribe or publish themselves.
    pub fn publish(&self, event: ModelEvent) {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .inner
            .read()
            .subscriptions
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == kind))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        trace!(
            ?kind,
            model = %event.model(),
            handlers = handlers.len(),
            "publishing model event"
        );

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(
                        subscription = ?id,
                        ?kind,
                        model = %event.model(),
                        error = %err,
                        "event handler returned an error"
                    );
                }
                Err(_) => {
                    error!(
                        subscription = ?id,
                        ?kind,
                        model = %event.model(),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn started(model: &str) -> ModelEvent {
        ModelEvent::ModelStarted {
            model: model.into(),
            at: Utc::now(),
        }
    }

    fn failed(model: &str) -> ModelEvent {
        ModelEvent::ModelFailed {
            model: model.into(),
            error: "boom".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let bus = EventCoordinator::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (label, kind) in [
            ("first", Some(EventKind::ModelStarted)),
            ("all", None),
            ("second", Some(EventKind::ModelStarted)),
            ("other", Some(EventKind::ModelFailed)),
        ] {
            let log = Arc::clone(&log);
            let handler = move |_: &ModelEvent| -> anyhow::Result<()> {
                log.lock().unwrap().push(label);
                Ok(())
            };
            match kind {
                Some(k) => bus.subscribe(k, handler),
                None => bus.subscribe_all(handler),
            };
        }

        bus.publish(started("A"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "all", "second"]);
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_delivery() {
        let bus = EventCoordinator::new();
        let seen = Arc::new(Mutex::new(0));

        bus.subscribe(EventKind::ModelFailed, |_| anyhow::bail!("handler broke"));
        bus.subscribe(EventKind::ModelFailed, |_| panic!("handler exploded"));
        let counter = Arc::clone(&seen);
        bus.subscribe(EventKind::ModelFailed, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.publish(failed("A"));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_and_clear_remove_handlers() {
        let bus = EventCoordinator::new();
        let a = bus.subscribe_all(|_| Ok(()));
        let _b = bus.subscribe(EventKind::ModelStarted, |_| Ok(()));

        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.subscriber_count(), 1);

        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn terminal_events_map_to_statuses() {
        assert_eq!(failed("A").terminal_status(), Some(ExecutionStatus::Failed));
        assert_eq!(started("A").terminal_status(), None);
        assert_eq!(failed("A").model(), "A");
    }
}
