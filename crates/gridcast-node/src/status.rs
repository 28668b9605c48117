//! Shared node status: role and the sync state heartbeats advertise.

use std::sync::{Arc, Mutex};

use gridcast_core::protocol::Heartbeat;

/// The local node's role. Assignment is user-driven and purely local: a
/// master authors edits, a peer applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Master,
    #[default]
    Peer,
}

#[derive(Debug, Default)]
struct StatusInner {
    role: Role,
    is_syncing: bool,
    progress: f32,
    filename: String,
}

/// Cloneable handle to the node's mutable status. Writers are the role
/// toggle and the sync engine; readers are the heartbeat loop and the
/// role gates on the control plane. Never held across IO.
#[derive(Debug, Clone, Default)]
pub struct NodeStatus {
    inner: Arc<Mutex<StatusInner>>,
}

impl NodeStatus {
    pub fn new(role: Role) -> Self {
        let status = Self::default();
        status.set_role(role);
        status
    }

    pub fn role(&self) -> Role {
        self.lock().role
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub fn set_role(&self, role: Role) {
        self.lock().role = role;
    }

    /// Update the sync status carried by outgoing heartbeats.
    pub fn set_sync_status(&self, is_syncing: bool, filename: &str, progress: f32) {
        let mut inner = self.lock();
        inner.is_syncing = is_syncing;
        inner.progress = progress.clamp(0.0, 1.0);
        if inner.filename != filename {
            inner.filename = filename.to_string();
        }
    }

    pub fn clear_sync_status(&self) {
        self.set_sync_status(false, "", 0.0);
    }

    /// Compose the heartbeat body for the given advertised sync port.
    pub fn heartbeat(&self, sync_port: u16) -> Heartbeat {
        let inner = self.lock();
        Heartbeat {
            is_master: inner.role == Role::Master,
            sync_port,
            is_syncing: inner.is_syncing,
            progress: inner.progress,
            filename: inner.filename.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_toggles() {
        let status = NodeStatus::new(Role::Peer);
        assert!(!status.is_master());
        status.set_role(Role::Master);
        assert!(status.is_master());
    }

    #[test]
    fn heartbeat_reflects_sync_state() {
        let status = NodeStatus::new(Role::Master);
        status.set_sync_status(true, "videos/foo.mp4", 0.5);

        let hb = status.heartbeat(40123);
        assert!(hb.is_master);
        assert_eq!(hb.sync_port, 40123);
        assert!(hb.is_syncing);
        assert_eq!(hb.progress, 0.5);
        assert_eq!(hb.filename, "videos/foo.mp4");

        status.clear_sync_status();
        let hb = status.heartbeat(40123);
        assert!(!hb.is_syncing);
        assert_eq!(hb.filename, "");
    }

    #[test]
    fn progress_is_clamped() {
        let status = NodeStatus::default();
        status.set_sync_status(true, "f", 7.0);
        assert_eq!(status.heartbeat(1).progress, 1.0);
    }
}
