#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Hall side of the gateway/hall split.
//!
//! A [`HallService`] answers the control surface (`Info`, `HealthCheck`),
//! keeps the gate stream open for its gateways and runs one task per session
//! stream. The first frame of a session is the login: the hall claims the
//! user through the player registry before serving anything, and a re-login
//! for a locally served user replaces the old session with `USER_INSTEAD`.

mod service;

pub use service::{EchoHandler, HallConfig, HallHandler, HallService};
