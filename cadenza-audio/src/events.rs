//! Event bus - typed publish/subscribe between engine components and observers
//!
//! Delivery is synchronous, in subscription order, on the thread that emits.
//! Handlers are snapshotted before delivery, so a handler may unsubscribe
//! itself or others without disturbing the event currently being delivered.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace};

use crate::buffer::BufferState;
use crate::core::OutputContext;
use crate::error::{EngineError, ErrorKind};
use crate::source::SourceId;

/// Event names understood by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SourcePlay,
    SourcePause,
    SourceEnded,
    SourceTimeUpdate,
    SourceError,
    SourceDisposed,
    BufferLoading,
    BufferLoaded,
    BufferProgress,
    BufferWaiting,
    BufferPlaying,
    Error,
    ErrorsCleared,
    VolumeChange,
    Reconfigured,
    StateChange,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        EventKind::SourcePlay,
        EventKind::SourcePause,
        EventKind::SourceEnded,
        EventKind::SourceTimeUpdate,
        EventKind::SourceError,
        EventKind::SourceDisposed,
        EventKind::BufferLoading,
        EventKind::BufferLoaded,
        EventKind::BufferProgress,
        EventKind::BufferWaiting,
        EventKind::BufferPlaying,
        EventKind::Error,
        EventKind::ErrorsCleared,
        EventKind::VolumeChange,
        EventKind::Reconfigured,
        EventKind::StateChange,
    ];

    /// Wire name of the event (`"source:play"`, `"buffer:progress"`, ...)
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SourcePlay => "source:play",
            EventKind::SourcePause => "source:pause",
            EventKind::SourceEnded => "source:ended",
            EventKind::SourceTimeUpdate => "source:timeupdate",
            EventKind::SourceError => "source:error",
            EventKind::SourceDisposed => "source:disposed",
            EventKind::BufferLoading => "buffer:loading",
            EventKind::BufferLoaded => "buffer:loaded",
            EventKind::BufferProgress => "buffer:progress",
            EventKind::BufferWaiting => "buffer:waiting",
            EventKind::BufferPlaying => "buffer:playing",
            EventKind::Error => "error",
            EventKind::ErrorsCleared => "errors-cleared",
            EventKind::VolumeChange => "engine:volumechange",
            EventKind::Reconfigured => "engine:reconfigured",
            EventKind::StateChange => "engine:statechange",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EngineError::InvalidValue {
                parameter: "event",
                reason: format!("unknown event name '{s}'"),
            })
    }
}

/// Payload delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SourcePlay {
        source_id: SourceId,
    },
    SourcePause {
        source_id: SourceId,
    },
    SourceEnded {
        source_id: SourceId,
    },
    SourceTimeUpdate {
        source_id: SourceId,
        current_time: f64,
        duration: f64,
    },
    SourceError {
        source_id: SourceId,
        kind: ErrorKind,
        message: String,
    },
    SourceDisposed {
        source_id: SourceId,
    },
    BufferLoading {
        source_id: SourceId,
    },
    BufferLoaded {
        source_id: SourceId,
        duration: f64,
    },
    BufferProgress {
        source_id: SourceId,
        state: BufferState,
    },
    BufferWaiting {
        source_id: SourceId,
    },
    BufferPlaying {
        source_id: SourceId,
    },
    Error {
        kind: ErrorKind,
        message: String,
        recoverable: bool,
        source_id: Option<SourceId>,
    },
    ErrorsCleared,
    VolumeChange {
        volume: f32,
        muted: bool,
    },
    Reconfigured {
        context: OutputContext,
    },
    StateChange {
        running: bool,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::SourcePlay { .. } => EventKind::SourcePlay,
            EngineEvent::SourcePause { .. } => EventKind::SourcePause,
            EngineEvent::SourceEnded { .. } => EventKind::SourceEnded,
            EngineEvent::SourceTimeUpdate { .. } => EventKind::SourceTimeUpdate,
            EngineEvent::SourceError { .. } => EventKind::SourceError,
            EngineEvent::SourceDisposed { .. } => EventKind::SourceDisposed,
            EngineEvent::BufferLoading { .. } => EventKind::BufferLoading,
            EngineEvent::BufferLoaded { .. } => EventKind::BufferLoaded,
            EngineEvent::BufferProgress { .. } => EventKind::BufferProgress,
            EngineEvent::BufferWaiting { .. } => EventKind::BufferWaiting,
            EngineEvent::BufferPlaying { .. } => EventKind::BufferPlaying,
            EngineEvent::Error { .. } => EventKind::Error,
            EngineEvent::ErrorsCleared => EventKind::ErrorsCleared,
            EngineEvent::VolumeChange { .. } => EventKind::VolumeChange,
            EngineEvent::Reconfigured { .. } => EventKind::Reconfigured,
            EngineEvent::StateChange { .. } => EventKind::StateChange,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Source the event is about, if any
    pub fn source_id(&self) -> Option<SourceId> {
        match self {
            EngineEvent::SourcePlay { source_id }
            | EngineEvent::SourcePause { source_id }
            | EngineEvent::SourceEnded { source_id }
            | EngineEvent::SourceTimeUpdate { source_id, .. }
            | EngineEvent::SourceError { source_id, .. }
            | EngineEvent::SourceDisposed { source_id }
            | EngineEvent::BufferLoading { source_id }
            | EngineEvent::BufferLoaded { source_id, .. }
            | EngineEvent::BufferProgress { source_id, .. }
            | EngineEvent::BufferWaiting { source_id }
            | EngineEvent::BufferPlaying { source_id } => Some(*source_id),
            EngineEvent::Error { source_id, .. } => *source_id,
            EngineEvent::ErrorsCleared
            | EngineEvent::VolumeChange { .. }
            | EngineEvent::Reconfigured { .. }
            | EngineEvent::StateChange { .. } => None,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(Handler),
    Channel(Sender<EngineEvent>),
}

struct Subscriber {
    id: SubscriptionId,
    filter: Option<Vec<EventKind>>,
    sink: Sink,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.filter.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }
}

/// Publish/subscribe hub shared by every engine component
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    /// Serializes delivery so events from different threads never interleave.
    /// Reentrant: a handler may emit (or call into the engine) while delivering.
    delivery: ReentrantMutex<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
        }
    }

    fn add(&self, filter: Option<Vec<EventKind>>, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber { id, filter, sink });
        debug!(subscription = id.0, "subscriber added");
        id
    }

    /// Subscribe a handler to one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(Some(vec![kind]), Sink::Callback(Arc::new(handler)))
    }

    /// Subscribe a handler to every event
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.add(None, Sink::Callback(Arc::new(handler)))
    }

    /// Unsubscribe; returns false if the handle was already removed
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscription = id.0, "subscriber removed");
        }
        removed
    }

    /// Receive every event on a channel
    ///
    /// The subscription is dropped automatically once the receiver is gone.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.add(None, Sink::Channel(tx));
        rx
    }

    /// Receive only the listed event kinds on a channel
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.add(Some(kinds.to_vec()), Sink::Channel(tx));
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every interested subscriber
    pub fn emit(&self, event: EngineEvent) {
        let _delivery = self.delivery.lock();
        let kind = event.kind();

        let targets: Vec<(SubscriptionId, Sink)> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.wants(kind))
            .map(|s| (s.id, s.sink.clone()))
            .collect();

        trace!(event = kind.as_str(), subscribers = targets.len(), "emit");

        let mut closed = Vec::new();
        for (id, sink) in targets {
            match sink {
                Sink::Callback(handler) => handler(&event),
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.subscribers.lock().retain(|s| !closed.contains(&s.id));
        }
    }

    /// Hold delivery order across a multi-step state change
    ///
    /// Components take this before locking their own state so that the events
    /// they emit afterwards come out in the order the transitions happened.
    pub(crate) fn ordered(&self) -> ReentrantMutexGuard<'_, ()> {
        self.delivery.lock()
    }

    /// Non-blocking variant of [`EventBus::ordered`] for the render path
    pub(crate) fn try_ordered(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        self.delivery.try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn play(id: u64) -> EngineEvent {
        EngineEvent::SourcePlay {
            source_id: SourceId::from_raw(id),
        }
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            bus.on(EventKind::SourcePlay, move |_| log.lock().push(tag));
        }
        bus.emit(play(1));

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_filter_by_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(EventKind::SourcePause, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(play(1));
        bus.emit(EngineEvent::SourcePause {
            source_id: SourceId::from_raw(1),
        });

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_delivery_keeps_remaining_handlers() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let (b, l, own) = (bus.clone(), log.clone(), own_id.clone());
        let id = bus.on(EventKind::SourcePlay, move |_| {
            l.lock().push("self-removing");
            if let Some(id) = *own.lock() {
                b.off(id);
            }
        });
        *own_id.lock() = Some(id);

        let l = log.clone();
        bus.on(EventKind::SourcePlay, move |_| l.lock().push("after"));

        bus.emit(play(1));
        bus.emit(play(2));

        assert_eq!(*log.lock(), vec!["self-removing", "after", "after"]);
    }

    #[test]
    fn test_off_twice_is_harmless() {
        let bus = EventBus::new();
        let id = bus.on_any(|_| {});
        assert!(bus.off(id));
        assert!(!bus.off(id));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::ErrorsCleared);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_channel_subscription_drops_with_receiver() {
        let bus = EventBus::new();
        let rx = bus.subscribe_to(&[EventKind::ErrorsCleared]);
        bus.emit(play(1));
        bus.emit(EngineEvent::ErrorsCleared);
        assert_eq!(rx.try_recv(), Ok(EngineEvent::ErrorsCleared));
        assert!(rx.try_recv().is_err());

        drop(rx);
        bus.emit(EngineEvent::ErrorsCleared);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_can_emit_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe_to(&[EventKind::ErrorsCleared]);
        let b = bus.clone();
        bus.on(EventKind::SourcePlay, move |_| b.emit(EngineEvent::ErrorsCleared));

        bus.emit(play(7));
        assert_eq!(rx.try_recv(), Ok(EngineEvent::ErrorsCleared));
    }

    #[test]
    fn test_event_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().ok(), Some(kind));
        }
        assert!("source:rewind".parse::<EventKind>().is_err());
    }
}
