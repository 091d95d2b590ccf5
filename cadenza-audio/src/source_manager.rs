//! Source lifecycle and transport
//!
//! At most one source is active (the one the render path plays from) and at
//! most one is loading. A new load supersedes the one in flight; the active
//! source is only replaced once the newcomer reaches `Ready`, so there is no
//! gap between tracks.
//!
//! Lock order: bus delivery guard, then `inner`, then the buffer manager.
//! Events are emitted with `inner` released. The render path never blocks on
//! the bus: when delivery is busy its notices wait in `backlog` until the
//! next block.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferManager;
use crate::error::{EngineError, ErrorContext, ErrorManager};
use crate::events::{EngineEvent, EventBus};
use crate::loader::{BackendError, SourceLoader};
use crate::pending::{Completer, Pending};
use crate::source::{Source, SourceId, SourceInfo, SourceState, StreamBuffer, TrackDescriptor};

/// Transport snapshot of the active source
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportState {
    /// Seconds
    pub current_time: f64,
    /// Seconds; the decoded extent while the total is unknown
    pub duration: f64,
    pub is_playing: bool,
}

struct PendingLoad {
    source: Source,
    completer: Option<Completer<SourceId>>,
    autoplay: bool,
}

#[derive(Default)]
struct Inner {
    active: Option<Source>,
    pending: Option<PendingLoad>,
}

enum Role {
    Pending,
    Active,
    Gone,
}

/// Work the render path could not deliver itself
enum Notice {
    Event(EngineEvent),
    Stall(SourceId),
    Resume(SourceId),
}

struct LoadJob {
    id: SourceId,
    descriptor: Arc<TrackDescriptor>,
    buffer: Arc<StreamBuffer>,
    cancel: Arc<AtomicBool>,
    target_rate: u32,
}

pub struct SourceManager {
    bus: Arc<EventBus>,
    errors: Arc<ErrorManager>,
    buffers: Arc<BufferManager>,
    loader: Arc<dyn SourceLoader>,
    inner: Mutex<Inner>,
    backlog: Mutex<Vec<Notice>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
    me: Weak<SourceManager>,
}

impl SourceManager {
    pub fn new(
        bus: Arc<EventBus>,
        errors: Arc<ErrorManager>,
        buffers: Arc<BufferManager>,
        loader: Arc<dyn SourceLoader>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            errors,
            buffers,
            loader,
            inner: Mutex::new(Inner::default()),
            backlog: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    /// Start loading `descriptor`, superseding any load still in flight
    ///
    /// Resolves with the new id once the source is `Ready` (and playing, with
    /// `autoplay`), or with `Cancelled` if another load replaces it first.
    pub fn create_source(
        &self,
        descriptor: TrackDescriptor,
        target_rate: u32,
        autoplay: bool,
    ) -> Pending<SourceId> {
        if self.disposed.load(Ordering::SeqCst) {
            return Pending::ready(Err(EngineError::Disposed));
        }
        if descriptor.locator.trim().is_empty() {
            return Pending::ready(Err(EngineError::InvalidValue {
                parameter: "locator",
                reason: "empty locator".to_string(),
            }));
        }
        if let Some(seconds) = descriptor.duration.filter(|d| !(d.is_finite() && *d >= 0.0)) {
            return Pending::ready(Err(EngineError::InvalidValue {
                parameter: "duration",
                reason: format!("{seconds} is not a valid length in seconds"),
            }));
        }

        let _order = self.bus.ordered();
        let id = SourceId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let descriptor = Arc::new(descriptor);
        let mut source = Source::new(id, descriptor.clone());
        let job = LoadJob {
            id,
            descriptor: descriptor.clone(),
            buffer: source.buffer.clone(),
            cancel: source.cancel.clone(),
            target_rate,
        };
        source.state = SourceState::Loading;

        let (completer, pending) = Pending::channel();
        let superseded = self.inner.lock().pending.replace(PendingLoad {
            source,
            completer: Some(completer),
            autoplay,
        });
        if let Some(old) = superseded {
            debug!(source = %old.source.id, by = %id, "load superseded");
            self.discard(old.source);
        }

        info!(source = %id, locator = %descriptor.locator, "loading source");
        self.buffers.track(id);
        self.spawn_loader(job);
        pending
    }

    fn spawn_loader(&self, job: LoadJob) {
        let id = job.id;
        let locator = job.descriptor.locator.clone();
        let manager = self.me.clone();
        let loader = self.loader.clone();
        let prefetch = self.buffers.policy().prefetch;

        let spawned = thread::Builder::new()
            .name(format!("cadenza-load-{}", id.raw()))
            .spawn(move || run_load(manager, loader, job, prefetch));

        if let Err(err) = spawned {
            self.fail(
                id,
                EngineError::SourceLoad {
                    locator,
                    reason: format!("could not start loader: {err}"),
                },
            );
        }
    }

    fn role(&self, id: SourceId) -> Role {
        let inner = self.inner.lock();
        if inner.pending.as_ref().is_some_and(|p| p.source.id == id) {
            Role::Pending
        } else if inner.active.as_ref().is_some_and(|s| s.id == id) {
            Role::Active
        } else {
            Role::Gone
        }
    }

    fn on_progress(&self, id: SourceId, ready: u64, total: Option<u64>, reached: bool) {
        let _order = self.bus.ordered();
        match self.role(id) {
            Role::Pending => {
                self.buffers.update_progress(id, ready, total);
                if reached {
                    self.promote(id);
                }
            }
            Role::Active => {
                self.buffers.update_progress(id, ready, total);
            }
            Role::Gone => {}
        }
    }

    fn on_complete(&self, id: SourceId, total: u64) {
        let _order = self.bus.ordered();
        match self.role(id) {
            Role::Pending => {
                self.buffers.complete(id, total);
                self.promote(id);
            }
            Role::Active => {
                self.buffers.complete(id, total);
            }
            Role::Gone => return,
        }
        debug!(source = %id, frames = total, "decode complete");
    }

    /// Loading -> Ready, replacing the active source; called with the bus
    /// ordering guard held
    fn promote(&self, id: SourceId) {
        let (previous, autoplay, duration, completer) = {
            let mut inner = self.inner.lock();
            if !inner.pending.as_ref().is_some_and(|p| p.source.id == id) {
                return;
            }
            let Some(mut load) = inner.pending.take() else {
                return;
            };
            load.source.state = SourceState::Ready;
            let duration = load.source.seek_limit();
            let previous = inner.active.replace(load.source);
            (previous, load.autoplay, duration, load.completer.take())
        };

        debug!(source = %id, duration, "source ready");
        self.buffers.notify_loaded(id, duration);
        if let Some(previous) = previous {
            self.discard(previous);
        }

        // A handler may have stopped or replaced the source meanwhile
        let mut still_active = false;
        let mut started = false;
        {
            let mut inner = self.inner.lock();
            if let Some(active) = inner.active.as_mut().filter(|s| s.id == id) {
                still_active = true;
                if autoplay && active.state == SourceState::Ready {
                    active.state = SourceState::Playing;
                    started = true;
                }
            }
        }
        if started {
            info!(source = %id, "playing");
            self.bus.emit(EngineEvent::SourcePlay { source_id: id });
        }

        if let Some(completer) = completer {
            completer.complete(if still_active {
                Ok(id)
            } else {
                Err(EngineError::Cancelled)
            });
        }
    }

    /// Report a load or decode failure for `id`
    fn fail(&self, id: SourceId, error: EngineError) {
        let _order = self.bus.ordered();
        let failed = {
            let mut inner = self.inner.lock();
            if inner.pending.as_ref().is_some_and(|p| p.source.id == id) {
                Some(inner.pending.take())
            } else if let Some(active) = inner
                .active
                .as_mut()
                .filter(|s| s.id == id && s.state != SourceState::Errored)
            {
                active.state = SourceState::Errored;
                Some(None)
            } else {
                None
            }
        };
        let Some(failed_load) = failed else {
            warn!(source = %id, %error, "failure from a source no longer tracked");
            return;
        };

        self.bus.emit(EngineEvent::SourceError {
            source_id: id,
            kind: ErrorManager::classify(&error),
            message: error.to_string(),
        });
        self.errors
            .handle_error(&error, ErrorContext::source(id, "load"));

        if let Some(mut load) = failed_load {
            load.source.state = SourceState::Errored;
            let completer = load.completer.take();
            self.discard(load.source);
            if let Some(completer) = completer {
                completer.complete(Err(error));
            }
        }
    }

    /// Cancel, release and announce a source that has left `inner`
    fn discard(&self, mut source: Source) {
        source.cancel();
        source.state = SourceState::Disposed;
        self.buffers.untrack(source.id);
        debug!(source = %source.id, "source disposed");
        self.bus.emit(EngineEvent::SourceDisposed {
            source_id: source.id,
        });
    }

    /// Ready/Paused -> Playing
    ///
    /// When nothing playable is active but a load is in flight, the load
    /// will start playing once ready.
    pub fn play(&self) -> Result<(), EngineError> {
        let _order = self.bus.ordered();
        let id = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match (inner.active.as_mut(), inner.pending.as_mut()) {
                (Some(active), _) if active.state == SourceState::Playing => return Ok(()),
                (Some(active), _)
                    if matches!(active.state, SourceState::Ready | SourceState::Paused) =>
                {
                    active.state = SourceState::Playing;
                    active.id
                }
                (_, Some(load)) => {
                    load.autoplay = true;
                    return Ok(());
                }
                (Some(active), None) => {
                    return Err(EngineError::InvalidState {
                        operation: "play",
                        state: active.state.as_str(),
                    })
                }
                (None, None) => return Err(EngineError::NoActiveSource),
            }
        };
        debug!(source = %id, "play");
        self.bus.emit(EngineEvent::SourcePlay { source_id: id });
        Ok(())
    }

    /// Playing -> Paused; the transport stops where it is
    pub fn pause(&self) -> Result<(), EngineError> {
        let _order = self.bus.ordered();
        let id = {
            let mut inner = self.inner.lock();
            let has_pending = inner.pending.is_some();
            if let Some(load) = inner.pending.as_mut() {
                load.autoplay = false;
            }
            match inner.active.as_mut() {
                Some(active) => match active.state {
                    SourceState::Playing => {
                        active.state = SourceState::Paused;
                        active.id
                    }
                    SourceState::Ready | SourceState::Paused => return Ok(()),
                    state => {
                        return Err(EngineError::InvalidState {
                            operation: "pause",
                            state: state.as_str(),
                        })
                    }
                },
                None if has_pending => return Ok(()),
                None => return Err(EngineError::NoActiveSource),
            }
        };
        debug!(source = %id, "pause");
        self.bus.emit(EngineEvent::SourcePause { source_id: id });
        Ok(())
    }

    /// Move the transport, clamped into `[0, duration]`; returns the new
    /// position in seconds
    pub fn seek(&self, seconds: f64) -> Result<f64, EngineError> {
        if !seconds.is_finite() {
            return Err(EngineError::InvalidValue {
                parameter: "seek",
                reason: format!("{seconds} is not a finite time"),
            });
        }

        let _order = self.bus.ordered();
        let (source_id, target, limit) = {
            let mut inner = self.inner.lock();
            let active = inner.active.as_mut().ok_or(EngineError::NoActiveSource)?;
            if !active.state.is_seekable() {
                return Err(EngineError::InvalidState {
                    operation: "seek",
                    state: active.state.as_str(),
                });
            }
            let limit = active.seek_limit();
            let target = seconds.clamp(0.0, limit);
            active.set_position_secs(target);
            (active.id, target, limit)
        };

        trace!(source = %source_id, position = target, requested = seconds, "seek");
        self.bus.emit(EngineEvent::SourceTimeUpdate {
            source_id,
            current_time: target,
            duration: limit,
        });
        Ok(target)
    }

    /// Pause, rewind and drop the active source; a load in flight is cancelled
    pub fn stop(&self) {
        let _order = self.bus.ordered();
        let (paused, rewound, active, pending) = {
            let mut inner = self.inner.lock();
            let mut paused = None;
            let mut rewound = None;
            if let Some(active) = inner.active.as_mut() {
                if active.state == SourceState::Playing {
                    active.state = SourceState::Paused;
                    paused = Some(active.id);
                }
                if active.state.is_seekable() {
                    active.set_position_secs(0.0);
                    rewound = Some(EngineEvent::SourceTimeUpdate {
                        source_id: active.id,
                        current_time: 0.0,
                        duration: active.seek_limit(),
                    });
                }
            }
            (paused, rewound, inner.active.take(), inner.pending.take())
        };

        if let Some(id) = paused {
            self.bus.emit(EngineEvent::SourcePause { source_id: id });
        }
        if let Some(event) = rewound {
            self.bus.emit(event);
        }
        if let Some(source) = active {
            self.discard(source);
        }
        if let Some(load) = pending {
            self.discard(load.source);
        }
    }

    /// Dispose one source, active or loading; false if it was already gone
    pub fn dispose(&self, id: SourceId) -> bool {
        let _order = self.bus.ordered();
        let source = {
            let mut inner = self.inner.lock();
            if inner.pending.as_ref().is_some_and(|p| p.source.id == id) {
                inner.pending.take().map(|load| load.source)
            } else if inner.active.as_ref().is_some_and(|s| s.id == id) {
                inner.active.take()
            } else {
                None
            }
        };
        match source {
            Some(source) => {
                self.discard(source);
                true
            }
            None => false,
        }
    }

    /// Dispose everything and refuse new loads
    pub fn dispose_all(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        let _order = self.bus.ordered();
        let (active, pending) = {
            let mut inner = self.inner.lock();
            (inner.active.take(), inner.pending.take())
        };
        if let Some(load) = pending {
            self.discard(load.source);
        }
        if let Some(source) = active {
            self.discard(source);
        }
        self.backlog.lock().clear();
    }

    pub fn active(&self) -> Option<SourceInfo> {
        self.inner.lock().active.as_ref().map(Source::info)
    }

    pub fn loading(&self) -> Option<SourceInfo> {
        self.inner.lock().pending.as_ref().map(|load| load.source.info())
    }

    /// Lifecycle state of `id`; `None` for ids this manager never issued
    pub fn state(&self, id: SourceId) -> Option<SourceState> {
        let inner = self.inner.lock();
        if let Some(load) = inner.pending.as_ref().filter(|p| p.source.id == id) {
            return Some(load.source.state);
        }
        if let Some(active) = inner.active.as_ref().filter(|s| s.id == id) {
            return Some(active.state);
        }
        (id.raw() >= 1 && id.raw() <= self.next_id.load(Ordering::SeqCst))
            .then_some(SourceState::Disposed)
    }

    pub fn transport(&self) -> TransportState {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|source| TransportState {
                current_time: source.position_secs(),
                duration: source.seek_limit(),
                is_playing: source.state == SourceState::Playing,
            })
            .unwrap_or_default()
    }

    /// Mix the active source into `out` (stereo interleaved, `out_rate`)
    ///
    /// Called from the render path; never blocks on the control side.
    pub fn render_into(&self, out: &mut [f32], out_rate: u32) {
        out.fill(0.0);
        let interval = self.buffers.policy().timeupdate_interval;
        let mut notices = Vec::new();
        {
            let Some(mut inner) = self.inner.try_lock() else {
                return;
            };
            if let Some(source) = inner
                .active
                .as_mut()
                .filter(|s| s.state == SourceState::Playing)
            {
                render_source(source, out, out_rate, interval, &mut notices);
            }
        }
        self.deliver(notices);
    }

    fn deliver(&self, notices: Vec<Notice>) {
        let Some(_order) = self.bus.try_ordered() else {
            if !notices.is_empty() {
                self.backlog.lock().extend(notices);
            }
            return;
        };

        let mut pending = mem::take(&mut *self.backlog.lock());
        pending.extend(notices);
        if pending.is_empty() {
            return;
        }

        let active = self.inner.lock().active.as_ref().map(|s| s.id);
        for notice in pending {
            match notice {
                Notice::Event(event) => {
                    // Anything about a source that has since been replaced is stale
                    if event.source_id().is_some() && event.source_id() != active {
                        continue;
                    }
                    self.bus.emit(event);
                }
                Notice::Stall(id) => {
                    self.buffers.stall(id);
                }
                Notice::Resume(id) => {
                    self.buffers.resume(id);
                }
            }
        }
    }
}

enum Outcome {
    Played,
    Starved,
    Ended,
}

/// Advance one playing source through a block, interpolating between its
/// own rate and the output rate
fn render_source(
    source: &mut Source,
    out: &mut [f32],
    out_rate: u32,
    timeupdate_interval: Duration,
    notices: &mut Vec<Notice>,
) {
    let src_rate = source.buffer.sample_rate();
    if src_rate == 0 || out_rate == 0 {
        return;
    }
    let Some(samples) = source.buffer.samples().try_read() else {
        return;
    };

    let step = f64::from(src_rate) / f64::from(out_rate);
    let available = samples.len() / 2;
    let complete = source.buffer.is_complete();
    let mut position = source.position.max(0.0);
    let mut outcome = Outcome::Played;

    for frame in out.chunks_exact_mut(2) {
        let index = position as usize;
        if index + 1 < available {
            let frac = (position - index as f64) as f32;
            let (a, b) = (index * 2, index * 2 + 2);
            frame[0] = samples[a] + (samples[b] - samples[a]) * frac;
            frame[1] = samples[a + 1] + (samples[b + 1] - samples[a + 1]) * frac;
        } else if index < available && complete {
            frame[0] = samples[index * 2];
            frame[1] = samples[index * 2 + 1];
        } else {
            outcome = if complete {
                Outcome::Ended
            } else {
                Outcome::Starved
            };
            break;
        }
        position += step;
    }
    drop(samples);

    let id = source.id;
    let rate = f64::from(src_rate);
    match outcome {
        Outcome::Ended => {
            source.position = available as f64;
            source.state = SourceState::Ended;
            notices.push(Notice::Event(EngineEvent::SourceEnded { source_id: id }));
            return;
        }
        Outcome::Starved => {
            source.position = position;
            if !source.starved {
                source.starved = true;
                notices.push(Notice::Stall(id));
            }
        }
        Outcome::Played => {
            source.position = position;
            if source.starved {
                source.starved = false;
                notices.push(Notice::Resume(id));
            }
        }
    }

    if source.position - source.last_timeupdate >= timeupdate_interval.as_secs_f64() * rate {
        source.last_timeupdate = source.position;
        let duration = source
            .duration()
            .unwrap_or(available as f64 / rate);
        notices.push(Notice::Event(EngineEvent::SourceTimeUpdate {
            source_id: id,
            current_time: source.position / rate,
            duration,
        }));
    }
}

/// Body of a loader thread: open, then pull chunks until done or cancelled
fn run_load(
    manager: Weak<SourceManager>,
    loader: Arc<dyn SourceLoader>,
    job: LoadJob,
    prefetch: Duration,
) {
    let LoadJob {
        id,
        descriptor,
        buffer,
        cancel,
        target_rate,
    } = job;
    let cancelled = || cancel.load(Ordering::SeqCst);
    let report = |error: EngineError| {
        if !cancelled() {
            if let Some(manager) = manager.upgrade() {
                manager.fail(id, error);
            }
        }
    };

    let mut stream = match loader.open(&descriptor, target_rate) {
        Ok(stream) => stream,
        Err(err) => {
            report(load_error(&descriptor, err));
            return;
        }
    };

    let rate = stream.sample_rate();
    if rate == 0 {
        report(EngineError::Decode {
            locator: descriptor.locator.clone(),
            reason: "stream reports a zero sample rate".to_string(),
        });
        return;
    }
    buffer.set_format(rate, stream.total_frames());
    let threshold = (prefetch.as_secs_f64() * f64::from(rate)).ceil() as u64;
    debug!(source = %id, sample_rate = rate, total = ?stream.total_frames(), "decode started");

    loop {
        if cancelled() {
            debug!(source = %id, "load cancelled");
            return;
        }
        match stream.next_chunk() {
            Ok(Some(chunk)) => {
                let ready = buffer.append(&chunk);
                trace!(source = %id, ready, "chunk decoded");
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.on_progress(id, ready, stream.total_frames(), ready >= threshold);
            }
            Ok(None) => {
                let total = buffer.finish();
                if let Some(manager) = manager.upgrade() {
                    manager.on_complete(id, total);
                }
                return;
            }
            Err(err) => {
                report(decode_error(&descriptor, err));
                return;
            }
        }
    }
}

fn load_error(descriptor: &TrackDescriptor, err: BackendError) -> EngineError {
    match err {
        BackendError::Decode(reason) => EngineError::Decode {
            locator: descriptor.locator.clone(),
            reason,
        },
        other => EngineError::SourceLoad {
            locator: descriptor.locator.clone(),
            reason: other.to_string(),
        },
    }
}

fn decode_error(descriptor: &TrackDescriptor, err: BackendError) -> EngineError {
    let reason = match err {
        BackendError::Decode(reason) => reason,
        other => other.to_string(),
    };
    EngineError::Decode {
        locator: descriptor.locator.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferPolicy;
    use crate::events::EventKind;
    use crate::loader::MemoryLoader;
    use crossbeam_channel::Receiver;

    const RATE: u32 = 1000;

    fn setup(loader: MemoryLoader) -> (Arc<SourceManager>, Receiver<EngineEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let errors = Arc::new(ErrorManager::new(bus.clone()));
        let buffers = Arc::new(BufferManager::new(bus.clone(), BufferPolicy::default()));
        (SourceManager::new(bus, errors, buffers, Arc::new(loader)), rx)
    }

    fn transport_kinds(rx: &Receiver<EngineEvent>) -> Vec<EventKind> {
        rx.try_iter()
            .map(|e| e.kind())
            .filter(|k| !k.as_str().starts_with("buffer:"))
            .collect()
    }

    fn clip(frames: usize) -> Vec<f32> {
        (0..frames).flat_map(|i| [i as f32, -(i as f32)]).collect()
    }

    fn loaded(locator: &str, frames: usize) -> (Arc<SourceManager>, Receiver<EngineEvent>, SourceId) {
        let loader = MemoryLoader::new();
        loader.insert(locator, clip(frames), RATE);
        let (manager, rx) = setup(loader);
        let id = manager
            .create_source(TrackDescriptor::new(locator), RATE, false)
            .wait_timeout(Duration::from_secs(5))
            .ok()
            .unwrap()
            .unwrap();
        (manager, rx, id)
    }

    #[test]
    fn test_load_reaches_ready() {
        let (manager, _rx, id) = loaded("a", 2000);
        assert_eq!(manager.state(id), Some(SourceState::Ready));
        assert_eq!(manager.transport().duration, 2.0);
        assert!(!manager.transport().is_playing);
    }

    #[test]
    fn test_render_advances_transport() {
        let (manager, _rx, _id) = loaded("a", 2000);
        manager.play().unwrap();

        let mut out = vec![0.0; 200];
        manager.render_into(&mut out, RATE);
        assert_eq!(&out[..4], &[0.0, 0.0, 1.0, -1.0]);
        assert!((manager.transport().current_time - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_render_resamples_by_rate_ratio() {
        let (manager, _rx, _id) = loaded("a", 2000);
        manager.play().unwrap();

        let mut out = vec![0.0; 8];
        manager.render_into(&mut out, RATE * 2);
        // Half steps interpolate between neighbours
        assert_eq!(&out[..6], &[0.0, 0.0, 0.5, -0.5, 1.0, -1.0]);
    }

    #[test]
    fn test_paused_source_renders_silence() {
        let (manager, _rx, _id) = loaded("a", 2000);
        let mut out = vec![1.0; 64];
        manager.render_into(&mut out, RATE);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(manager.transport().current_time, 0.0);
    }

    #[test]
    fn test_playing_to_end() {
        let (manager, rx, id) = loaded("a", 300);
        manager.play().unwrap();
        let mut out = vec![0.0; 1000];
        // The tail is only final once the loader has finished
        for _ in 0..500 {
            manager.render_into(&mut out, RATE);
            if manager.state(id) == Some(SourceState::Ended) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(manager.state(id), Some(SourceState::Ended));
        assert!(rx.try_iter().any(|e| e == EngineEvent::SourceEnded { source_id: id }));
        assert!(matches!(
            manager.play(),
            Err(EngineError::InvalidState { state: "ended", .. })
        ));
    }

    #[test]
    fn test_seek_clamps_and_reports() {
        let (manager, rx, id) = loaded("a", 2000);
        rx.try_iter().for_each(drop);

        assert_eq!(manager.seek(10.0), Ok(2.0));
        assert_eq!(manager.transport().current_time, 2.0);
        assert_eq!(manager.seek(-3.0), Ok(0.0));
        assert!(manager.seek(f64::NAN).is_err());

        let updates: Vec<f64> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::SourceTimeUpdate { source_id, current_time, .. } if source_id == id => {
                    Some(current_time)
                }
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![2.0, 0.0]);
    }

    #[test]
    fn test_bad_duration_hint_is_rejected() {
        let loader = MemoryLoader::new();
        loader.insert("a", clip(100), RATE);
        let (manager, _rx) = setup(loader);

        for hint in [-1.0, f64::NAN, f64::INFINITY] {
            let result = manager
                .create_source(TrackDescriptor::new("a").with_duration(hint), RATE, true)
                .wait();
            assert!(matches!(
                result,
                Err(EngineError::InvalidValue { parameter: "duration", .. })
            ));
        }
        assert!(manager.active().is_none());
        assert!(manager.loading().is_none());
    }

    #[test]
    fn test_pause_and_play_emit() {
        let (manager, rx, id) = loaded("a", 2000);
        rx.try_iter().for_each(drop);
        manager.play().unwrap();
        manager.play().unwrap();
        manager.pause().unwrap();
        manager.pause().unwrap();
        assert_eq!(
            transport_kinds(&rx),
            vec![EventKind::SourcePlay, EventKind::SourcePause]
        );
        assert_eq!(manager.state(id), Some(SourceState::Paused));
    }

    #[test]
    fn test_transport_without_source() {
        let (manager, _rx) = setup(MemoryLoader::new());
        assert_eq!(manager.play(), Err(EngineError::NoActiveSource));
        assert_eq!(manager.seek(1.0), Err(EngineError::NoActiveSource));
        assert_eq!(manager.transport(), TransportState::default());
        assert_eq!(manager.state(SourceId::from_raw(4)), None);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (manager, rx, id) = loaded("a", 2000);
        rx.try_iter().for_each(drop);
        assert!(manager.dispose(id));
        assert!(!manager.dispose(id));
        assert_eq!(manager.state(id), Some(SourceState::Disposed));
        let disposed = rx
            .try_iter()
            .filter(|e| e.kind() == EventKind::SourceDisposed)
            .count();
        assert_eq!(disposed, 1);
    }

    #[test]
    fn test_unreachable_locator_fails_load() {
        let (manager, rx) = setup(MemoryLoader::new());
        let result = manager
            .create_source(TrackDescriptor::new("nowhere"), RATE, true)
            .wait_timeout(Duration::from_secs(5))
            .ok()
            .unwrap();
        assert!(matches!(result, Err(EngineError::SourceLoad { .. })));
        assert!(manager.active().is_none());
        let kinds: Vec<EventKind> = rx.try_iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::BufferLoading,
                EventKind::SourceError,
                EventKind::Error,
                EventKind::SourceDisposed,
            ]
        );
    }

    #[test]
    fn test_empty_locator_is_rejected() {
        let (manager, rx) = setup(MemoryLoader::new());
        let result = manager.create_source(TrackDescriptor::new("  "), RATE, true).wait();
        assert!(matches!(result, Err(EngineError::InvalidValue { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_rewinds_and_drops() {
        let (manager, rx, id) = loaded("a", 2000);
        manager.play().unwrap();
        let mut out = vec![0.0; 200];
        manager.render_into(&mut out, RATE);
        rx.try_iter().for_each(drop);

        manager.stop();
        assert!(manager.active().is_none());
        assert_eq!(manager.state(id), Some(SourceState::Disposed));
        assert_eq!(
            transport_kinds(&rx),
            vec![
                EventKind::SourcePause,
                EventKind::SourceTimeUpdate,
                EventKind::SourceDisposed,
            ]
        );
    }

    #[test]
    fn test_disposed_manager_refuses_loads() {
        let (manager, _rx, _id) = loaded("a", 100);
        manager.dispose_all();
        assert!(manager.active().is_none());
        let result = manager.create_source(TrackDescriptor::new("a"), RATE, false).wait();
        assert_eq!(result, Err(EngineError::Disposed));
    }
}
