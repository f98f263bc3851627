//! relaybus: a realtime topic pub/sub message bus.
//!
//! One WebSocket per client carries any number of named channels; channel
//! members exchange broadcasts and share a reconciled presence set, and
//! server instances relay traffic to each other through a pluggable fabric.
//! This facade re-exports the library crates; the bus server itself lives
//! in `services/server`.

pub use rb_client as client;
pub use rb_fabric as fabric;
pub use rb_protocol as protocol;
