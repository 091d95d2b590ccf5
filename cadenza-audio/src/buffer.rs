//! Buffer bookkeeping per source
//!
//! BufferManager never touches audio data. The source manager reports how
//! much has been decoded and whether playback is starving; this module keeps
//! the per-source record and turns changes into `buffer:*` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::BufferPolicy;
use crate::events::{EngineEvent, EventBus};
use crate::source::SourceId;

/// How much playable audio a source has
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferState {
    /// Decoded frames available for playback
    pub ready_frames: u64,
    /// Total frames, once known
    pub total_frames: Option<u64>,
    /// Waiting for data: before the first ready point and while stalled
    pub is_buffering: bool,
    /// 0-100, or 0 while the total is unknown
    pub progress_percent: f32,
}

struct Tracked {
    state: BufferState,
    last_percent: f32,
    last_emit: Option<Instant>,
    stalled: bool,
}

pub struct BufferManager {
    bus: Arc<EventBus>,
    policy: BufferPolicy,
    entries: Mutex<HashMap<SourceId, Tracked>>,
}

impl BufferManager {
    pub fn new(bus: Arc<EventBus>, policy: BufferPolicy) -> Self {
        Self {
            bus,
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BufferPolicy {
        &self.policy
    }

    /// Start tracking a source; emits `buffer:loading`
    pub fn track(&self, id: SourceId) -> BufferState {
        let state = BufferState {
            is_buffering: true,
            ..BufferState::default()
        };
        self.entries.lock().insert(
            id,
            Tracked {
                state,
                last_percent: 0.0,
                last_emit: None,
                stalled: false,
            },
        );
        debug!(source = %id, "buffer tracked");
        self.bus.emit(EngineEvent::BufferLoading { source_id: id });
        state
    }

    /// Record decode progress; `ready` never moves backwards
    pub fn update_progress(&self, id: SourceId, ready: u64, total: Option<u64>) -> Option<BufferState> {
        let (state, emit) = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(&id)?;
            let state = &mut entry.state;

            state.ready_frames = state.ready_frames.max(ready);
            if total.is_some() {
                state.total_frames = total;
            }
            state.progress_percent = percent(state.ready_frames, state.total_frames);

            let now = Instant::now();
            let stepped = state.progress_percent - entry.last_percent >= self.policy.progress_step;
            let spaced = entry
                .last_emit
                .map_or(true, |at| now.duration_since(at) >= self.policy.progress_interval);
            let emit = entry.last_emit.is_none() || (stepped && spaced);
            if emit {
                entry.last_percent = state.progress_percent;
                entry.last_emit = Some(now);
            }
            (*state, emit)
        };

        if emit {
            trace!(source = %id, ready = state.ready_frames, percent = state.progress_percent, "buffer progress");
            self.bus.emit(EngineEvent::BufferProgress { source_id: id, state });
        }
        Some(state)
    }

    /// Decoding finished: everything is ready
    pub fn complete(&self, id: SourceId, total: u64) -> Option<BufferState> {
        let state = self.modify(id, |entry| {
            entry.state.ready_frames = entry.state.ready_frames.max(total);
            entry.state.total_frames = Some(entry.state.ready_frames);
            entry.state.progress_percent = 100.0;
            entry.last_percent = 100.0;
            entry.last_emit = Some(Instant::now());
        })?;
        self.bus.emit(EngineEvent::BufferProgress { source_id: id, state });
        Some(state)
    }

    /// Enough is buffered to start; emits `buffer:loaded`
    pub fn notify_loaded(&self, id: SourceId, duration: f64) -> Option<BufferState> {
        let (state, flipped) = self.flip(id, false, |_| {})?;
        if flipped {
            self.bus.emit(EngineEvent::BufferProgress { source_id: id, state });
        }
        self.bus.emit(EngineEvent::BufferLoaded {
            source_id: id,
            duration,
        });
        Some(state)
    }

    /// Playback ran out of data; emits `buffer:waiting` once per stall
    pub fn stall(&self, id: SourceId) -> bool {
        let Some((state, flipped)) = self.flip(id, true, |entry| entry.stalled = true) else {
            return false;
        };
        if flipped {
            debug!(source = %id, "playback stalled");
            self.bus.emit(EngineEvent::BufferProgress { source_id: id, state });
            self.bus.emit(EngineEvent::BufferWaiting { source_id: id });
        }
        flipped
    }

    /// Data arrived after a stall; emits `buffer:playing`
    pub fn resume(&self, id: SourceId) -> bool {
        let stalled = self
            .entries
            .lock()
            .get(&id)
            .map_or(false, |entry| entry.stalled);
        if !stalled {
            return false;
        }
        let Some((state, _)) = self.flip(id, false, |entry| entry.stalled = false) else {
            return false;
        };
        debug!(source = %id, "playback resumed");
        self.bus.emit(EngineEvent::BufferProgress { source_id: id, state });
        self.bus.emit(EngineEvent::BufferPlaying { source_id: id });
        true
    }

    pub fn is_stalled(&self, id: SourceId) -> bool {
        self.entries
            .lock()
            .get(&id)
            .map_or(false, |entry| entry.stalled)
    }

    pub fn get_state(&self, id: SourceId) -> Option<BufferState> {
        self.entries.lock().get(&id).map(|entry| entry.state)
    }

    /// Forget a disposed source
    pub fn untrack(&self, id: SourceId) {
        if self.entries.lock().remove(&id).is_some() {
            debug!(source = %id, "buffer released");
        }
    }

    fn modify(&self, id: SourceId, f: impl FnOnce(&mut Tracked)) -> Option<BufferState> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        f(entry);
        Some(entry.state)
    }

    /// Set `is_buffering`, reporting whether it changed
    fn flip(
        &self,
        id: SourceId,
        buffering: bool,
        f: impl FnOnce(&mut Tracked),
    ) -> Option<(BufferState, bool)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        let flipped = entry.state.is_buffering != buffering;
        entry.state.is_buffering = buffering;
        f(entry);
        Some((entry.state, flipped))
    }
}

fn percent(ready: u64, total: Option<u64>) -> f32 {
    match total {
        Some(0) => 100.0,
        Some(total) => ((ready as f64 / total as f64) * 100.0).min(100.0) as f32,
        None => 0.0,
    }
}
