//! Decode backend and player settings for Cadenza

mod loader;
mod settings;

pub use loader::{fold_to_stereo, SymphoniaLoader, SymphoniaStream, MAX_BAD_PACKETS};
pub use settings::PlayerSettings;
