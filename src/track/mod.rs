//! Tracker black box.
//!
//! The tracking algorithm itself is opaque to the pipeline. A backend loads named image
//! targets during setup and is then fed frames one at a time from a worker thread owned
//! by its tracker stage.

mod backend;
pub mod backends;
mod result;
mod target;

use anyhow::{anyhow, Context, Result};

pub use backend::TrackerBackend;
pub use backends::StubTracker;
pub use result::{TargetInstance, TargetStatus, TrackerResult};
pub use target::ImageTarget;

use crate::config::TrackerSettings;

/// Builds and loads a tracker backend described by configuration.
pub fn build_tracker(settings: &TrackerSettings) -> Result<Box<dyn TrackerBackend>> {
    let mut backend: Box<dyn TrackerBackend> = match settings.backend.as_str() {
        "stub" => Box::new(
            StubTracker::new(&settings.name)
                .with_simultaneous(settings.simultaneous)
                .with_delay(settings.delay),
        ),
        other => return Err(anyhow!("tracker '{}': unknown backend '{}'", settings.name, other)),
    };

    for target in &settings.targets {
        let image = match &target.path {
            Some(path) => ImageTarget::from_file(&target.name, path, target.scale)?,
            None => ImageTarget::from_bytes(&target.name, target.name.as_bytes(), target.scale)?,
        };
        let runtime_id = backend
            .load_target(image)
            .with_context(|| format!("tracker '{}': load target '{}'", settings.name, target.name))?;
        log::info!(
            "tracker {}: loaded target {} (runtime id {})",
            settings.name,
            target.name,
            runtime_id
        );
    }
    Ok(backend)
}
