#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Wire protocol between gateways and halls.
//!
//! Every logical stream is its own TCP connection, opened with a `Hello`
//! frame naming the stream kind: a *control* connection for in-order unary
//! calls (`Info`, `HealthCheck`), a long-lived *gate* stream for hall-pushed
//! control traffic and liveness, and one *session* stream per client
//! conversation. The same codec carries the gateway's client-facing surface.

mod client;
mod conn;
mod frame;
mod listener;
mod protocol;

pub use client::{GateStream, HallClient, SessionSink, SessionStream};
pub use conn::{split, FrameReader, FrameWriter};
pub use frame::{
    encode_frame, parse_client_hello, parse_client_push, parse_frame, parse_session_data, Frame,
    HallMessage, Health, Hello, Info,
};
pub use listener::{HallApi, HallListener, SessionChannel};
pub use protocol::{FrameKind, HallStatus, StreamKind, HEADER_SIZE, MAX_FRAME_LEN, PROTOCOL_VERSION};
