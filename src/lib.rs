//! Multi-camera accident detection pipeline: a partitioned pub/sub bus,
//! per-camera decode/resample, a shared batched inference worker, and a
//! per-camera incident aggregator, wired up by a session coordinator.

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod session;
pub mod web;
