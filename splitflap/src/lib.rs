#![doc(html_root_url = "https://docs.rs/splitflap/0.1.0")]

//! <h1 align="center">SPLITFLAP - serial session for splitflap displays</h1>
//!
//! # Features
//!
//! **Splitflap** talks to a splitflap display controller over a serial port.
//!
//! - Open a [`Splitflap`](hardware::Splitflap) session through an [`IoTransport`](io::IoTransport)
//!   ([`Serial`](io::Serial) for real hardware)
//! - Every message is a protobuf payload, CRC32-checked and COBS-framed (see [`io::codec`])
//! - Outgoing messages are acknowledged by the device and resent when an ack goes missing
//! - Register async handlers per message type (`splitflap_state`, `log`, `ack`, `general_state`)
//! - Move modules with [`set_positions`](hardware::Splitflap::set_positions) or
//!   [`set_text`](hardware::Splitflap::set_text)
//!
//! # Getting Started
//!
//! - Add the following to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! splitflap = "0.1.0"
//! ```
//!
//! The following code prints the flap index of every module, ten times per second.
//! ```no_run
//! use splitflap::hardware::{splitflap_context, SplitflapEvent};
//! use splitflap::io::{ask_for_serial_port, SplitflapState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), splitflap::errors::Error> {
//!     let port = ask_for_serial_port()?;
//!     let session = splitflap_context(port)?;
//!
//!     session.on(SplitflapEvent::OnState, |state: SplitflapState| async move {
//!         for (i, module) in state.modules.iter().enumerate() {
//!             println!("Module {}: flap {}", i, module.flap_index);
//!         }
//!     });
//!
//!     for _ in 0..10 {
//!         session.request_state()?;
//!         splitflap::pause!(100);
//!     }
//!     session.close().await
//! }
//! ```
//!
//! # Feature flags
//!
//! - **libudev** -- (enabled by default) Activates `serialport` crate _libudev_ feature under-the-hood (required on Linux only for port listing).
//! - **serde** -- Enables serialize/deserialize capabilities for messages and the serial transport.
//! - **mocks** -- Provides mocked transports (useful for tests mostly).

pub mod errors;
pub mod hardware;
pub mod io;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod utils;
