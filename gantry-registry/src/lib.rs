#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Distributed registries over the coordination store.
//!
//! A [`Registry`] owns one store lease for the lifetime of the process and
//! runs three coupled registries under it:
//!
//! - [`PeerRegistry`]: publishes this peer's attributes and mirrors every
//!   other peer from the `/peer/attribute/` prefix;
//! - [`ServiceRegistry`]: acquires named service locks with conditional
//!   writes and mirrors the global service set into a prefix index;
//! - [`PlayerRegistry`]: claims fleet-wide exclusive ownership of user ids.
//!
//! All watch loops resynchronize from a fresh snapshot when their stream
//! dies and retry transient store failures on a fixed one second backoff.

mod handler;
mod peer;
mod player;
mod registry;
mod service;
mod trie;

pub use handler::{PeerHandler, PlayerHandler, ServiceHandler};
pub use peer::PeerRegistry;
pub use player::PlayerRegistry;
pub use registry::{Registry, RegistryConfig};
pub use service::{RegisterOptions, ServiceRegistry, WhereOptions};
pub use trie::WordTrie;

use std::time::Duration;

/// Backoff applied by every watch loop between failures.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(1);
