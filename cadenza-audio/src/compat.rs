//! Element-style event names for shells written against media-element
//! listeners (`loadstart`, `canplay`, `timeupdate`, ...)
//!
//! Nothing else in the engine knows this vocabulary.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyEvent {
    LoadStart,
    LoadedData,
    CanPlay,
    Progress,
    Play,
    Playing,
    Pause,
    Waiting,
    TimeUpdate,
    Ended,
    Error,
    VolumeChange,
}

impl LegacyEvent {
    pub const ALL: [LegacyEvent; 12] = [
        LegacyEvent::LoadStart,
        LegacyEvent::LoadedData,
        LegacyEvent::CanPlay,
        LegacyEvent::Progress,
        LegacyEvent::Play,
        LegacyEvent::Playing,
        LegacyEvent::Pause,
        LegacyEvent::Waiting,
        LegacyEvent::TimeUpdate,
        LegacyEvent::Ended,
        LegacyEvent::Error,
        LegacyEvent::VolumeChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LegacyEvent::LoadStart => "loadstart",
            LegacyEvent::LoadedData => "loadeddata",
            LegacyEvent::CanPlay => "canplay",
            LegacyEvent::Progress => "progress",
            LegacyEvent::Play => "play",
            LegacyEvent::Playing => "playing",
            LegacyEvent::Pause => "pause",
            LegacyEvent::Waiting => "waiting",
            LegacyEvent::TimeUpdate => "timeupdate",
            LegacyEvent::Ended => "ended",
            LegacyEvent::Error => "error",
            LegacyEvent::VolumeChange => "volumechange",
        }
    }

    /// Element-style names an engine event stands for, in dispatch order
    pub fn translate(event: &EngineEvent) -> &'static [LegacyEvent] {
        match event {
            EngineEvent::BufferLoading { .. } => &[LegacyEvent::LoadStart],
            EngineEvent::BufferLoaded { .. } => &[LegacyEvent::LoadedData, LegacyEvent::CanPlay],
            EngineEvent::BufferProgress { .. } => &[LegacyEvent::Progress],
            EngineEvent::BufferWaiting { .. } => &[LegacyEvent::Waiting],
            EngineEvent::BufferPlaying { .. } => &[LegacyEvent::Playing],
            EngineEvent::SourcePlay { .. } => &[LegacyEvent::Play, LegacyEvent::Playing],
            EngineEvent::SourcePause { .. } => &[LegacyEvent::Pause],
            EngineEvent::SourceTimeUpdate { .. } => &[LegacyEvent::TimeUpdate],
            EngineEvent::SourceEnded { .. } => &[LegacyEvent::Ended],
            EngineEvent::SourceError { .. } => &[LegacyEvent::Error],
            // Source failures already surfaced through source:error
            EngineEvent::Error { source_id: None, .. } => &[LegacyEvent::Error],
            EngineEvent::VolumeChange { .. } => &[LegacyEvent::VolumeChange],
            EngineEvent::Error { .. }
            | EngineEvent::SourceDisposed { .. }
            | EngineEvent::ErrorsCleared
            | EngineEvent::Reconfigured { .. }
            | EngineEvent::StateChange { .. } => &[],
        }
    }
}

impl fmt::Display for LegacyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegacyEvent {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LegacyEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| EngineError::InvalidValue {
                parameter: "event",
                reason: format!("unknown element event '{s}'"),
            })
    }
}

type Listener = Arc<dyn Fn(LegacyEvent, &EngineEvent) + Send + Sync>;

/// Re-publishes engine events under element-style names
///
/// Listeners receive the element name and the engine event it came from.
/// Dropping the bridge unsubscribes it.
pub struct LegacyEventBridge {
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
    listeners: Arc<Mutex<Vec<(LegacyEvent, Listener)>>>,
}

impl LegacyEventBridge {
    pub fn attach(bus: &Arc<EventBus>) -> Self {
        let listeners: Arc<Mutex<Vec<(LegacyEvent, Listener)>>> = Arc::default();
        let dispatch = listeners.clone();

        let subscription = bus.on_any(move |event| {
            for &name in LegacyEvent::translate(event) {
                let targets: Vec<Listener> = dispatch
                    .lock()
                    .iter()
                    .filter(|(wanted, _)| *wanted == name)
                    .map(|(_, listener)| listener.clone())
                    .collect();
                for listener in targets {
                    listener(name, event);
                }
            }
        });
        debug!("legacy event bridge attached");

        Self {
            bus: bus.clone(),
            subscription,
            listeners,
        }
    }

    /// Listen for an element-style event by name
    pub fn add_listener<F>(&self, name: &str, listener: F) -> Result<(), EngineError>
    where
        F: Fn(LegacyEvent, &EngineEvent) + Send + Sync + 'static,
    {
        let event = name.parse()?;
        self.listeners.lock().push((event, Arc::new(listener)));
        Ok(())
    }

    /// Drop every listener registered for `name`
    pub fn remove_listeners(&self, name: &str) -> Result<usize, EngineError> {
        let event: LegacyEvent = name.parse()?;
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(wanted, _)| *wanted != event);
        Ok(before - listeners.len())
    }
}

impl Drop for LegacyEventBridge {
    fn drop(&mut self) {
        self.bus.off(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::source::SourceId;

    #[test]
    fn test_names_round_trip() {
        for event in LegacyEvent::ALL {
            assert_eq!(event.as_str().parse::<LegacyEvent>(), Ok(event));
        }
        assert!("loaded".parse::<LegacyEvent>().is_err());
    }

    #[test]
    fn test_source_errors_are_not_doubled() {
        let id = SourceId::from_raw(1);
        let source_error = EngineEvent::SourceError {
            source_id: id,
            kind: ErrorKind::Decode,
            message: "bad frame".into(),
        };
        let forwarded = EngineEvent::Error {
            kind: ErrorKind::Decode,
            message: "bad frame".into(),
            recoverable: true,
            source_id: Some(id),
        };
        assert_eq!(LegacyEvent::translate(&source_error), &[LegacyEvent::Error]);
        assert!(LegacyEvent::translate(&forwarded).is_empty());
    }

    #[test]
    fn test_bridge_dispatches_by_name() {
        let bus = Arc::new(EventBus::new());
        let bridge = LegacyEventBridge::attach(&bus);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["play", "playing", "canplay"] {
            let seen = seen.clone();
            bridge
                .add_listener(name, move |event, _| seen.lock().push(event))
                .unwrap();
        }
        assert!(bridge.add_listener("seeking", |_, _| {}).is_err());

        let id = SourceId::from_raw(3);
        bus.emit(EngineEvent::BufferLoaded {
            source_id: id,
            duration: 1.0,
        });
        bus.emit(EngineEvent::SourcePlay { source_id: id });
        assert_eq!(
            *seen.lock(),
            vec![LegacyEvent::CanPlay, LegacyEvent::Play, LegacyEvent::Playing]
        );

        assert_eq!(bridge.remove_listeners("play"), Ok(1));
        drop(bridge);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
