//! Defines the splitflap display session.

mod session;

pub use session::{
    splitflap_context, Splitflap, SplitflapData, SplitflapEvent, LEGACY_FLAPS, MAX_ATTEMPTS,
    RETRY_TIMEOUT,
};
