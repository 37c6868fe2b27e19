//! Latency benchmark for a transaction relay against a broadcast network.
//!
//! Both feeds are subscribed at once, observations are matched by hash in
//! fixed intervals, and the timing differences are summarized per interval.

pub mod benchmark;
pub mod config;
pub mod export;
pub mod migrate;
pub mod observation;
pub mod reconcile;
pub mod row;
pub mod sink;
pub mod source;
pub mod stats;
