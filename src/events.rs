//! Event fan-out.
//!
//! Pub/sub keyed by event category. Each observer gets its own bounded queue
//! drained by a dedicated worker thread, so a slow observer never blocks the
//! producing component or its fellow observers; it only loses its own
//! newest events once its queue is full (with a warning logged). Fan-out
//! order within a category is registration order.
//!
//! This is the delegate replacement: absence of a subscriber is simply an
//! empty table, not a missing optional method.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Error;
use crate::faces::FaceInfo;
use crate::state::{CameraState, EffectState, RecorderState, SdkState};

/// Per-observer queue bound. An observer more than this far behind starts
/// losing its newest events.
const OBSERVER_QUEUE_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCategory {
    StateChange,
    Error,
    FaceDetection,
    FilterListUpdate,
    Performance,
}

/// Everything the kernel reports to observers.
#[derive(Clone, Debug)]
pub enum Event {
    SdkStateChanged(SdkState),
    CameraStateChanged(CameraState),
    EffectStateChanged {
        effect_id: String,
        state: EffectState,
    },
    RecorderStateChanged(RecorderState),
    Error(Error),
    FacesDetected(Vec<FaceInfo>),
    /// The set of known filters changed (e.g. a cloud filter became ready).
    FilterListUpdated,
    /// A stage exceeded the frame budget and was skipped for one frame.
    /// Degradation, not an error.
    PerformanceWarning {
        stage_id: String,
        budget: Duration,
        elapsed: Duration,
    },
}

impl Event {
    pub fn category(&self) -> EventCategory {
        match self {
            Event::SdkStateChanged(_)
            | Event::CameraStateChanged(_)
            | Event::EffectStateChanged { .. }
            | Event::RecorderStateChanged(_) => EventCategory::StateChange,
            Event::Error(_) => EventCategory::Error,
            Event::FacesDetected(_) => EventCategory::FaceDetection,
            Event::FilterListUpdated => EventCategory::FilterListUpdate,
            Event::PerformanceWarning { .. } => EventCategory::Performance,
        }
    }
}

/// Opaque handle returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct ObserverSlot {
    token: u64,
    category: EventCategory,
    tx: SyncSender<Event>,
    worker: JoinHandle<()>,
}

struct DispatcherInner {
    next_token: u64,
    slots: Vec<ObserverSlot>,
}

/// Category-keyed event dispatcher. Publishing never blocks the producer.
pub struct EventDispatcher {
    inner: Mutex<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                next_token: 0,
                slots: Vec::new(),
            }),
        }
    }

    /// Register an observer for one category. The observer runs on its own
    /// delivery thread and must not assume any particular calling context.
    pub fn subscribe<F>(&self, category: EventCategory, observer: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<Event>(OBSERVER_QUEUE_DEPTH);
        let worker = std::thread::spawn(move || {
            for event in rx {
                observer(&event);
            }
        });

        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.slots.push(ObserverSlot {
            token,
            category,
            tx,
            worker,
        });
        SubscriptionToken(token)
    }

    /// Remove an observer and join its delivery thread: the thread drains
    /// what it already accepted and exits before this returns, so nothing
    /// reaches the observer afterwards. Returns false for an unknown token.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.slots.iter().position(|slot| slot.token == token.0) {
            Some(index) => index,
            None => return false,
        };
        let slot = inner.slots.remove(index);
        drop(inner);

        // Dropping the sender closes the queue; join outside the table lock
        // so draining observers cannot stall publishers. An observer that
        // unsubscribes itself from its own callback would deadlock on the
        // join, so that case detaches instead.
        drop(slot.tx);
        if slot.worker.thread().id() != std::thread::current().id() {
            let _ = slot.worker.join();
        }
        true
    }

    /// Deliver an event to every observer of its category, in registration
    /// order. A full observer queue drops this event for that observer only.
    pub fn publish(&self, event: Event) {
        let category = event.category();
        let mut inner = self.inner.lock().unwrap();
        inner.slots.retain(|slot| {
            if slot.category != category {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "observer {} lagging on {:?}; event dropped for it",
                        slot.token,
                        category
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn observer_count(&self, category: EventCategory) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|slot| slot.category == category)
            .count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
