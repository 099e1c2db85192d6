use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Session lifecycle phases, in the order a session passes through them.
///
/// `ImageBuilt`, `PreLoginDone` and `PostLoginDone` are skipped when the
/// working directory already carries the completion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Init,
    KeypairReady,
    ImageBuilt,
    VmRunning,
    ConsoleReady,
    ProxyRunning,
    SshReady,
    Mounted,
    PreLoginDone,
    LoginScreenSeen,
    LoggedIn,
    PostLoginDone,
    Complete,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::KeypairReady => "keypair_ready",
            Self::ImageBuilt => "image_built",
            Self::VmRunning => "vm_running",
            Self::ConsoleReady => "console_ready",
            Self::ProxyRunning => "proxy_running",
            Self::SshReady => "ssh_ready",
            Self::Mounted => "mounted",
            Self::PreLoginDone => "pre_login_done",
            Self::LoginScreenSeen => "login_screen_seen",
            Self::LoggedIn => "logged_in",
            Self::PostLoginDone => "post_login_done",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Session event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Event key (e.g., "session.phase", "session.shutdown")
    pub key: String,

    /// Phase reached, for phase events
    pub phase: Option<SessionPhase>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl SessionEvent {
    /// Create an event with no phase
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            phase: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create a phase transition event
    pub fn phase(phase: SessionPhase) -> Self {
        Self {
            key: events::SESSION_PHASE.to_string(),
            phase: Some(phase),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<SessionEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const SESSION_PHASE: &str = "session.phase";
    pub const SESSION_FAILED: &str = "session.failed";
    pub const SESSION_SHUTDOWN: &str = "session.shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive_phase() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(SessionEvent::phase(SessionPhase::VmRunning));
        emitter.emit(SessionEvent::empty(events::SESSION_SHUTDOWN));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, events::SESSION_PHASE);
        assert_eq!(first.phase, Some(SessionPhase::VmRunning));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.key, events::SESSION_SHUTDOWN);
        assert!(second.phase.is_none());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        // Should not panic
        emitter.emit(SessionEvent::phase(SessionPhase::Init));
    }

    #[test]
    fn test_phase_display_matches_serde() {
        let json = serde_json::to_string(&SessionPhase::LoginScreenSeen).unwrap();
        assert_eq!(json, "\"login_screen_seen\"");
        assert_eq!(SessionPhase::LoginScreenSeen.to_string(), "login_screen_seen");
    }
}
