//! Generated protobuf types for the ingress wire.

include!(concat!(env!("OUT_DIR"), "/aggregator.rs"));
