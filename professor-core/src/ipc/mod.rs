//! Types published to the UI host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over its own event bus unchanged.

pub mod events;
