//! Core module - supervision, composition, downloads, subscriptions and upgrades

mod app_state;
pub mod bundle;
pub mod compose;
pub mod dashboard;
pub mod download;
pub mod events;
pub mod install;
pub mod process;
pub mod settings;
pub mod subscription;
pub mod upgrade;

pub use app_state::{AppState, ConfigView, Outcome};
pub use compose::ComposeOptions;
pub use download::{Destination, DownloadEngine, DownloadError, DownloadOutput};
pub use events::{Artifact, Event, EventBus};
pub use process::{CoreBinary, CoreState, CoreSupervisor};
pub use settings::{EnhancedMode, Paths, Settings, APP_NAME};
pub use subscription::SubscriptionStore;
pub use upgrade::{UpgradeConfig, UpgradeCoordinator};
