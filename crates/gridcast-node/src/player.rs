//! Content players: what a surface's `content_id` resolves to at render
//! time.
//!
//! The renderer is external; players here only manage playback state and
//! hand out a texture reference. Decoding is out of scope: a video player
//! tracks its synced media path and clock, nothing more.

use std::path::PathBuf;
use std::time::Duration;

use gridcast_core::mapping::PLACEHOLDER_CONTENT_ID;

/// Opaque reference the renderer maps to an actual texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureRef {
    /// The built-in test pattern.
    TestPattern,
    /// A frame source backed by a synced media file.
    Media(PathBuf),
}

/// A playable content source bound to a surface.
#[derive(Debug, Clone)]
pub enum Player {
    /// Default source when no content is bound.
    TestPattern,
    /// Video-backed source; `position` advances while playing.
    Video {
        path: PathBuf,
        playing: bool,
        position: Duration,
    },
}

impl Player {
    /// Resolve a `content_id` against the videos folder.
    pub fn for_content(content_id: &str, videos_root: &std::path::Path) -> Self {
        if content_id == PLACEHOLDER_CONTENT_ID || content_id.is_empty() {
            Player::TestPattern
        } else {
            Player::Video {
                path: videos_root.join(content_id),
                playing: false,
                position: Duration::ZERO,
            }
        }
    }

    /// Prepare the source. The test pattern needs nothing; a video resets
    /// its clock.
    pub fn setup(&mut self) {
        if let Player::Video { position, playing, .. } = self {
            *position = Duration::ZERO;
            *playing = false;
        }
    }

    pub fn start(&mut self) {
        if let Player::Video { playing, .. } = self {
            *playing = true;
        }
    }

    pub fn stop(&mut self) {
        if let Player::Video { playing, .. } = self {
            *playing = false;
        }
    }

    /// Advance playback by one frame interval.
    pub fn tick(&mut self, dt: Duration) {
        if let Player::Video {
            playing: true,
            position,
            ..
        } = self
        {
            *position += dt;
        }
    }

    /// The texture the renderer should sample this frame.
    pub fn current_texture(&self) -> TextureRef {
        match self {
            Player::TestPattern => TextureRef::TestPattern,
            Player::Video { path, .. } => TextureRef::Media(path.clone()),
        }
    }
}
