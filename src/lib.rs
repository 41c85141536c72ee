//! DeckyClash - control plane for a supervised mihomo proxy core
//!
//! Components:
//! - [`core::CoreSupervisor`](crate::core::CoreSupervisor) owns the core child process
//! - [`core::compose`](crate::core::compose) builds the runtime config from a subscription
//! - [`core::DownloadEngine`](crate::core::DownloadEngine) performs single-flight downloads
//! - [`core::SubscriptionStore`](crate::core::SubscriptionStore) keeps the ordered subscription registry
//! - [`core::UpgradeCoordinator`](crate::core::UpgradeCoordinator) installs releases of the package, core and yq
//!
//! [`core::AppState`](crate::core::AppState) ties them together as the surface a UI bridge calls.

pub mod core;
pub mod error;
pub mod external;
pub mod persistence;
pub mod platform;

pub use error::{Error, Result};
