//! Callback seams for registry events.
//!
//! Handlers are invoked synchronously, in registration order, from the watch
//! loop that observed the event. A panicking handler is isolated so delivery
//! continues to the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use gantry_core::{LocalPlayer, Peer, ServiceName};
use tracing::error;

/// Observes peers joining, changing attributes and leaving the fleet.
///
/// `on_peer_add` for a given peer is always delivered before any update or
/// delete for that peer.
pub trait PeerHandler: Send + Sync {
    fn on_peer_add(&self, _peer: &Peer) {}
    fn on_peer_update(&self, _peer: &Peer) {}
    fn on_peer_delete(&self, _peer: &Peer) {}
}

pub trait ServiceHandler: Send + Sync {
    fn on_service_add(&self, _service: &ServiceName) {}
    fn on_service_delete(&self, _service: &ServiceName) {}
}

pub trait PlayerHandler: Send + Sync {
    fn on_local_player_add(&self, _player: &LocalPlayer) {}
    fn on_local_player_delete(&self, _player: &LocalPlayer) {}
}

pub(crate) fn notify<H: ?Sized, F>(handlers: &[Arc<H>], target: &'static str, mut f: F)
where
    F: FnMut(&H),
{
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| f(handler.as_ref()))).is_err() {
            error!(target: "gantry::registry", handler_target = target, "handler panicked during event delivery");
        }
    }
}
