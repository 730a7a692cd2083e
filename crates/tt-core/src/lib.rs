//! Core pipeline for teamtrace: classification of watched paths, debounced
//! file watching, in-memory state aggregation, and the durable session
//! history store.
//!
//! Data flows disk -> [`watcher::FileWatcher`] -> [`aggregator::StateAggregator`]
//! -> ([`store::SessionStore`], broadcast), with the watcher emitting one
//! ordered stream of classified events and the aggregator merging them one
//! at a time into the canonical [`aggregator::TeamState`].

pub mod aggregator;
pub mod classify;
pub mod config;
pub mod debounce;
pub mod shutdown;
pub mod store;
pub mod types;
pub mod watcher;
