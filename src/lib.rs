//! Library surface for the Prometheus metric aggregator sidecar.
//!
//! `main.rs` wires these modules together; `tests/aggregation.rs` exercises the
//! end-to-end scenarios against [`collector::Collector`] directly.

pub mod atomic_f64;
pub mod child;
pub mod collector;
pub mod config;
pub mod formatting;
pub mod histogram;
pub mod ingress;
pub mod registry;
pub mod registry_index;
pub mod sample;
pub mod scrape;
pub mod selfmetrics;
pub mod vector;
pub mod wire;
