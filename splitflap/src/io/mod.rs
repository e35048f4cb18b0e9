//! Defines how bytes and messages travel between the host and the splitflap controller.

pub mod codec;
mod messages;
mod transports;

pub use messages::*;
pub use transports::*;
