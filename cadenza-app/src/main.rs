//! Cadenza - command line music player
//!
//! Plays the files given on the command line in order through the default
//! output device.

mod output;

use std::sync::Arc;

use anyhow::{bail, Context};
use cadenza_audio::{
    AudioEngine, EngineError, EngineEvent, EventKind, SourceId, TrackDescriptor,
};
use cadenza_library::{PlayerSettings, SymphoniaLoader};
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::output::CpalOutput;

/// How a track finished
enum Finish {
    Ended,
    Skipped,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        bail!("usage: cadenza <file>...");
    }

    let settings = PlayerSettings::load();
    let output = CpalOutput::new().context("opening audio output")?;
    let engine = AudioEngine::new(
        Box::new(output),
        Arc::new(SymphoniaLoader::new()),
        settings.engine,
    )
    .context("starting audio engine")?;

    engine.set_volume(settings.volume)?;
    engine.set_muted(settings.muted);
    if let Some(preset) = &settings.eq_preset {
        if let Err(e) = engine.effects().apply_preset(preset) {
            warn!(preset = %preset, error = %e, "ignoring equalizer preset from settings");
        }
    }

    let events = engine
        .events()
        .subscribe_to(&[EventKind::SourceEnded, EventKind::Error]);

    let mut skipped = 0;
    for (index, file) in files.iter().enumerate() {
        info!(track = index + 1, of = files.len(), file = %file, "loading");

        let id = match engine.play(TrackDescriptor::new(file.as_str())).wait() {
            Ok(id) => id,
            Err(e @ EngineError::Device(_)) => {
                return Err(e).context("output device failed");
            }
            Err(e) => {
                warn!(file = %file, error = %e, "skipping track");
                skipped += 1;
                continue;
            }
        };
        if let Some(source) = engine.active_source() {
            info!(
                file = %file,
                duration = source.duration.unwrap_or_default(),
                "playing"
            );
        }

        match wait_for_finish(&events, id)? {
            Finish::Ended => {}
            Finish::Skipped => skipped += 1,
        }
    }

    engine.dispose();
    if skipped > 0 {
        warn!(skipped, "some tracks could not be played");
    }
    Ok(())
}

/// Block until the source ends or fails. Recoverable failures move on to
/// the next track; a device failure ends the program.
fn wait_for_finish(events: &Receiver<EngineEvent>, id: SourceId) -> anyhow::Result<Finish> {
    for event in events.iter() {
        match event {
            EngineEvent::SourceEnded { source_id } if source_id == id => return Ok(Finish::Ended),
            EngineEvent::Error {
                recoverable: false,
                message,
                kind,
                ..
            } => {
                error!(%kind, %message, "playback stopped");
                bail!("{kind} error: {message}");
            }
            EngineEvent::Error {
                source_id: Some(source_id),
                message,
                ..
            } if source_id == id => {
                warn!(source = %id, %message, "track failed, moving on");
                return Ok(Finish::Skipped);
            }
            _ => {}
        }
    }
    bail!("engine event stream closed")
}
