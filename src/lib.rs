//! AR frame pipeline.
//!
//! Moves camera frames through a graph of processing stages (throttle, forks, tracker
//! branches, a join) into a single-slot buffer read by the render loop, without letting
//! the camera block, without queues growing, and releasing every frame buffer exactly
//! once.
//!
//! # Module Structure
//!
//! - `frame`: Capture, feedback and result frames; pixel buffers released on last drop
//! - `pipeline`: Stage trait, graph assembly and routing, the built-in stages
//! - `track`: Tracker backends (black boxes) and image targets
//! - `ingest`: Capture sources
//! - `session`: Standard topology and session lifecycle
//! - `render`: Render-side polling and pose conversion
//! - `config`: Session configuration (file + environment)

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod camera;
pub mod config;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod track;

pub use camera::{CameraDeviceType, CameraParameters, Matrix44};
pub use config::SessionConfig;
pub use frame::{
    CaptureFrame, FeedbackFrame, FrameStatus, PixelBuffer, PixelFormat, ResultFrame, ResultSlot,
};
pub use pipeline::{Graph, GraphBuilder, SinkReader, TopologyError};
pub use session::ArSession;
pub use track::{TrackerBackend, TrackerResult};

/// Tracker and target names: 1..64 of `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<()> {
    // Compile once for hot paths.
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

    if !re.is_match(name) {
        return Err(anyhow!(
            "name '{}' must match ^[A-Za-z0-9_-]{{1,64}}$",
            name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("starrynight").is_ok());
        assert!(validate_name("face_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("starry night").is_err());
        assert!(validate_name("../irises").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }
}
