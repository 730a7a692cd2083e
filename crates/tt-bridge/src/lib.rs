//! Observer transport for teamtrace.
//!
//! This crate fans the aggregated team state out to connected observers and
//! answers their point-to-point requests:
//! - [`hub`]: per-observer outbound queues with non-blocking publish
//! - [`protocol`]: the message-framed wire protocol, envelope included
//! - [`http`]: the WebSocket endpoint plus the REST read surface
//! - [`state`]: shared handler state

pub mod http;
pub mod hub;
pub mod protocol;
pub mod state;

mod ws;
