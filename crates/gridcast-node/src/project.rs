//! On-disk project layout.
//!
//! ```text
//! <project>/
//!   settings.json                    { "ID": "<8 chars>" }
//!   synced/
//!     configs/<peer>.mappings.json   mapping documents, one per peer
//!     videos/...                     media files, mirrored from the master
//! ```

use std::path::{Path, PathBuf};

use gridcast_core::Result;

/// Resolved paths of one project directory, created on startup.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    synced: PathBuf,
    configs: PathBuf,
    videos: PathBuf,
    settings: PathBuf,
}

impl ProjectLayout {
    /// Resolve the layout under `root` and create the synced tree.
    pub fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let synced = root.join("synced");
        let configs = synced.join("configs");
        let videos = synced.join("videos");
        std::fs::create_dir_all(&configs)?;
        std::fs::create_dir_all(&videos)?;
        Ok(Self {
            settings: root.join("settings.json"),
            root,
            synced,
            configs,
            videos,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The shared root the sync engine and bulk server operate on.
    pub fn synced(&self) -> &Path {
        &self.synced
    }

    pub fn configs(&self) -> &Path {
        &self.configs
    }

    pub fn videos(&self) -> &Path {
        &self.videos
    }

    pub fn settings(&self) -> &Path {
        &self.settings
    }

    /// The mapping document owned by the given peer.
    pub fn mappings_path_for(&self, peer_id: &str) -> PathBuf {
        self.configs.join(format!("{peer_id}.mappings.json"))
    }
}
