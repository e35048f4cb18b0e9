use log::error;
use snafu::Snafu;

use crate::errors::ProtocolError::{DecodeFailed, IoException};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Runtime error: Are you sure your code runs inside a tokio runtime?
    RuntimeError,
    /// Protocol error: {source}.
    ProtocolError { source: ProtocolError },
    /// Session error: {source}.
    SessionError { source: SessionError },
    /// Unknown error: {info}.
    Unknown { info: String },
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        error!("std::io error {:?}", error);
        let info = match error.kind() {
            std::io::ErrorKind::NotFound => String::from("Splitflap not found or already in use"),
            std::io::ErrorKind::PermissionDenied => String::from("Splitflap connection lost"),
            _ => error.to_string(),
        };
        Self::ProtocolError {
            source: IoException { info },
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(error: prost::DecodeError) -> Self {
        Self::ProtocolError {
            source: DecodeFailed {
                info: error.to_string(),
            },
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(value: ProtocolError) -> Self {
        Self::ProtocolError { source: value }
    }
}

impl From<SessionError> for Error {
    fn from(value: SessionError) -> Self {
        Self::SessionError { source: value }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    /// {info}
    IoException { info: String },
    /// Connection has not been initialized
    NotInitialized,
    /// Connection is closed
    ConnectionClosed,
    /// Not enough bytes received - '{operation}' expected {expected} bytes, {received} received
    MessageTooShort {
        operation: &'static str,
        expected: usize,
        received: usize,
    },
    /// Invalid COBS framing
    InvalidFraming,
    /// Frame exceeds {max} bytes
    FrameTooLong { max: usize },
    /// Checksum mismatch - computed {expected}, received {received}
    ChecksumMismatch { expected: u32, received: u32 },
    /// Unable to decode message - {info}
    DecodeFailed { info: String },
    /// Message {nonce} not acknowledged after {attempts} attempts
    AckTimeout { nonce: u32, attempts: usize },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
    /// Module count unknown: no state received from the splitflap yet
    UnknownModuleCount,
    /// Too many positions - {given} given, the splitflap has {available} modules
    TooManyModules { given: usize, available: usize },
    /// Unknown module {index}
    UnknownModule { index: usize },
    /// Character '{character}' is not available on the flaps
    UnsupportedCharacter { character: char },
    /// No serial port available
    NoSerialPort,
    /// Invalid port selection '{input}'
    InvalidSelection { input: String },
}
