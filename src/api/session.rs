//! Client-side authentication session.
//!
//! Credentials themselves live in cookies owned by the transport. This module
//! only tracks whether a session was established (the persisted marker),
//! the session state and the current user.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::model::CurrentUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never logged in, or logged out
    Anonymous,
    /// A session was established and has not failed yet
    Active,
    /// The session could not be refreshed; the user must log in again
    Expired,
}

/// Persistence of the "a session was established" marker
pub trait SessionMarkerStore: Send + Sync {
    fn load(&self) -> bool;
    fn store(&self, established: bool) -> io::Result<()>;
}

/// Marker kept in memory only
#[derive(Debug, Default)]
pub struct MemoryMarker(AtomicBool);

impl MemoryMarker {
    pub fn new(established: bool) -> Self {
        Self(AtomicBool::new(established))
    }
}

impl SessionMarkerStore for MemoryMarker {
    fn load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn store(&self, established: bool) -> io::Result<()> {
        self.0.store(established, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerFile {
    established_at: DateTime<Utc>,
}

/// Marker persisted as a small JSON file; absent file means no session
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionMarkerStore for FileMarker {
    fn load(&self) -> bool {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<MarkerFile>(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    fn store(&self, established: bool) -> io::Result<()> {
        if !established {
            return match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let marker = MarkerFile {
            established_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&marker)?;
        std::fs::write(&self.path, bytes)
    }
}

/// Session state shared by the API client and the engine
pub struct AuthSession {
    marker: Arc<dyn SessionMarkerStore>,
    state: watch::Sender<SessionState>,
    user: RwLock<Option<CurrentUser>>,
}

impl AuthSession {
    pub fn new(marker: Arc<dyn SessionMarkerStore>) -> Self {
        let initial = if marker.load() {
            SessionState::Active
        } else {
            SessionState::Anonymous
        };
        let (state, _) = watch::channel(initial);

        Self {
            marker,
            state,
            user: RwLock::new(None),
        }
    }

    /// Whether a refresh is worth attempting on 401
    pub fn has_marker(&self) -> bool {
        self.marker.load()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn user(&self) -> Option<CurrentUser> {
        self.user.read().clone()
    }

    pub fn user_id(&self) -> Option<i64> {
        self.user.read().as_ref().map(|user| user.id)
    }

    pub fn set_user(&self, user: Option<CurrentUser>) {
        *self.user.write() = user;
    }

    /// Record a successful login
    pub fn establish(&self) {
        self.write_marker(true);
        self.state.send_replace(SessionState::Active);
        info!("Session established");
    }

    /// Refresh failed for good
    pub fn expire(&self) {
        self.write_marker(false);
        self.user.write().take();
        if self.state.send_replace(SessionState::Expired) != SessionState::Expired {
            warn!("Session expired, please log in again");
        }
    }

    /// Explicit logout
    pub fn clear(&self) {
        self.write_marker(false);
        self.user.write().take();
        self.state.send_replace(SessionState::Anonymous);
        info!("Session cleared");
    }

    /// Apply an account validation change; returns whether anything changed
    pub fn set_validated(&self, validated: bool) -> bool {
        match self.user.write().as_mut() {
            Some(user) if user.validated != validated => {
                user.validated = validated;
                info!("Account validation changed to {}", validated);
                true
            }
            _ => false,
        }
    }

    fn write_marker(&self, established: bool) {
        if let Err(e) = self.marker.store(established) {
            error!("Failed to persist session marker: {}", e);
        }
    }
}
