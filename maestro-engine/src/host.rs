// Host Callbacks
// Decision points the engine hands back to the embedding host

use async_trait::async_trait;

/// Callbacks the host supplies for decisions the engine cannot make itself
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    /// The iteration cap was reached. Return extra budget to continue,
    /// `None` to stop the piece.
    async fn grant_iterations(&self, used: u32, cap: u32) -> Option<u32>;

    /// A matched rule requires user input. `None` cancels the piece.
    async fn user_input(&self, movement: &str, prompt: &str) -> Option<String>;

    /// A movement reported blocked. `Some(input)` continues the movement
    /// with the input appended; `None` aborts.
    async fn resolve_blocked(&self, movement: &str, content: &str) -> Option<String>;

    /// Persist a session id under its session key
    async fn persist_session(&self, key: &str, session_id: &str);
}

/// Host that declines every decision; useful for non-interactive runs
pub struct NullHost;

#[async_trait]
impl HostCallbacks for NullHost {
    async fn grant_iterations(&self, _used: u32, _cap: u32) -> Option<u32> {
        None
    }

    async fn user_input(&self, _movement: &str, _prompt: &str) -> Option<String> {
        None
    }

    async fn resolve_blocked(&self, _movement: &str, _content: &str) -> Option<String> {
        None
    }

    async fn persist_session(&self, _key: &str, _session_id: &str) {}
}
