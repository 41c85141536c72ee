//! Events pushed to whoever fronts the control plane (UI bridge, logs)

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Artifacts managed by the upgrade coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    /// The control plane's own package
    Package,
    /// The supervised proxy core
    Core,
    /// The auxiliary yq binary
    Tool,
}

impl Artifact {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Core => "core",
            Self::Tool => "yq",
        }
    }

    pub fn all() -> &'static [Artifact] {
        &[Artifact::Package, Artifact::Core, Artifact::Tool]
    }
}

/// Notification emitted by a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The core exited, with its code (negative signal number, or none if unknown)
    CoreExit { code: Option<i32> },
    /// A subscription was added
    SubscriptionUpdated { name: String },
    /// An upgrade download advanced to a new whole percent
    DownloadProgress { artifact: Artifact, percent: u8 },
}

/// Fan-out channel for [`Event`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: Event) {
        trace!("Emitting {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
