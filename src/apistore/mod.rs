//! Locally cached views of control-plane entities
//!
//! Each store runs a background refresh loop pulling its entity set into a
//! keyed snapshot. Snapshots are copy-on-write: a refresh builds a fresh map
//! and swaps it in atomically, so concurrent readers always hold a
//! consistent point-in-time view and never lock against the refresher.
//! On refresh failure the prior snapshot is retained and the failure is
//! logged; staleness hurts observability, not correctness.

pub mod applicationstore;
pub mod commandstore;
pub mod deploymentstore;
pub mod environmentstore;
pub mod eventstore;

pub use applicationstore::{ApplicationLister, ApplicationStore};
pub use commandstore::{CommandLister, CommandStore};
pub use deploymentstore::{DeploymentLister, DeploymentStore};
pub use environmentstore::EnvironmentStore;
pub use eventstore::{EventGetter, EventStore};

use std::time::Duration;

/// Default refresh period shared by the entity stores.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
