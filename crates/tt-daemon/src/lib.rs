//! Process wiring for teamtrace: configuration, logging, and the daemon
//! that runs the watch -> aggregate -> {persist, broadcast} pipeline.

pub mod daemon;
pub mod logging;
