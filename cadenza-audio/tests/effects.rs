mod common;

use cadenza_audio::{EffectKind, EngineError};
use common::*;

fn rendered(configure: impl Fn(&cadenza_audio::EffectsChain)) -> Vec<f32> {
    let h = harness(ScriptedLoader::new().with("track.wav", Script::seconds(1.0)));
    configure(h.engine.effects());
    let id = resolve(h.engine.play("track.wav")).unwrap();
    wait_buffered(&h.engine, id);
    h.output.pump_blocks(20, 512)
}

#[test]
fn test_disabled_modules_leave_signal_untouched() {
    let reference = rendered(|_| {});
    let bypassed = rendered(|effects| {
        effects.set_threshold(-40.0).unwrap();
        effects.set_ratio(10.0).unwrap();
        effects.set_width(0.0).unwrap();
        effects.set_ceiling(-6.0).unwrap();
        effects.apply_preset("bass-boost").unwrap();
        effects.set_enabled(EffectKind::Equalizer, false);
    });
    assert_eq!(reference, bypassed);
}

#[test]
fn test_rejected_threshold_keeps_previous() {
    let h = harness(ScriptedLoader::new());
    let effects = h.engine.effects();
    effects.set_threshold(-24.0).unwrap();
    assert!(matches!(
        effects.set_threshold(5.0),
        Err(EngineError::Configuration { parameter: "threshold", .. })
    ));
    assert_eq!(effects.threshold(), -24.0);
    assert!(drain(&h.events).is_empty());
}

#[test]
fn test_preset_then_custom() {
    let h = harness(ScriptedLoader::new());
    let effects = h.engine.effects();
    effects.apply_preset("rock").unwrap();
    assert_eq!(effects.current_preset_name(), "rock");
    effects.set_band_gain(0, effects.band_values()[0] + 1.0).unwrap();
    assert_eq!(effects.current_preset_name(), "custom");
}
