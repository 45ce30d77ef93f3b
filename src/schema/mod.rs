//! wellness.replay.v1 schema
//!
//! This module defines the recorded-drive input format used by the CLI to
//! replay a session through the engine on a simulated clock.

mod replay_event;
mod adapter;

pub use replay_event::*;
pub use adapter::*;
