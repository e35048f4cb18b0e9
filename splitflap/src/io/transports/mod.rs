use crate::errors::Error;
use dyn_clone::DynClone;
use std::fmt::{Debug, Display};
use std::time::Duration;

pub mod serial;

pub use serial::{ask_for_serial_port, select_serial_port, Serial};

dyn_clone::clone_trait_object!(IoTransport);

/// A byte pipe to the splitflap controller.
///
/// Clones of a transport share the same underlying connection: the session reads from one
/// clone and writes through another.
pub trait IoTransport: Debug + Display + DynClone + Send + Sync {
    /// Opens communication (in a blocking way) using the transport layer.
    ///
    /// # Notes
    ///  The method is sync and may block until the connection is established.
    fn open(&mut self) -> Result<(), Error>;

    /// Gracefully shuts down the transport layer.
    fn close(&mut self) -> Result<(), Error>;

    /// Sets the read timeout of the transport layer.
    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error>;

    /// Writes all of `buf` to the connection. For more details see [`std::io::Write::write_all`].
    ///
    /// # Notes
    /// This function blocks until the write operation is complete.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Reads available bytes into `buf` and returns how many were read.
    ///
    /// # Notes
    /// This function blocks at most for the configured timeout: `Ok(0)` means nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}
