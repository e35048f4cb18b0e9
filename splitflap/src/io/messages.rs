//! Protobuf messages exchanged with the splitflap firmware.
//!
//! The host sends [`ToSplitflap`] messages (each carrying a nonce the device acknowledges) and
//! receives [`FromSplitflap`] messages.

/// Host-to-device envelope.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct ToSplitflap {
    /// Echoed back by the device in an [`Ack`].
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
    #[prost(oneof = "to_splitflap::Payload", tags = "3, 4")]
    pub payload: Option<to_splitflap::Payload>,
}

pub mod to_splitflap {
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "3")]
        SplitflapConfig(super::SplitflapConfig),
        #[prost(message, tag = "4")]
        RequestState(super::RequestState),
    }
}

/// Device-to-host envelope.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct FromSplitflap {
    #[prost(oneof = "from_splitflap::Payload", tags = "1, 2, 3, 5")]
    pub payload: Option<from_splitflap::Payload>,
}

pub mod from_splitflap {
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        SplitflapState(super::SplitflapState),
        #[prost(message, tag = "2")]
        Log(super::Log),
        #[prost(message, tag = "3")]
        Ack(super::Ack),
        #[prost(message, tag = "5")]
        GeneralState(super::GeneralState),
    }

    impl Payload {
        /// The message-type name handlers register for.
        pub fn name(&self) -> &'static str {
            match self {
                Payload::SplitflapState(_) => "splitflap_state",
                Payload::Log(_) => "log",
                Payload::Ack(_) => "ack",
                Payload::GeneralState(_) => "general_state",
            }
        }
    }
}

/// Snapshot of every module of the display, in chain order.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct SplitflapState {
    #[prost(message, repeated, tag = "1")]
    pub modules: Vec<ModuleState>,
    #[prost(enumeration = "splitflap_state::Mode", tag = "2")]
    pub mode: i32,
}

pub mod splitflap_state {
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Mode {
        Normal = 0,
        SensorTest = 1,
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct ModuleState {
    #[prost(enumeration = "module_state::State", tag = "1")]
    pub state: i32,
    /// Current rotational position, independent of the home sensor.
    #[prost(uint32, tag = "2")]
    pub flap_index: u32,
    #[prost(bool, tag = "3")]
    pub moving: bool,
    /// Raw home sensor reading: true while the magnet is detected.
    #[prost(bool, tag = "4")]
    pub sensor_state: bool,
    #[prost(uint32, tag = "5")]
    pub count_unexpected_home: u32,
    #[prost(uint32, tag = "6")]
    pub count_missed_home: u32,
}

pub mod module_state {
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum State {
        Normal = 0,
        LookForHome = 1,
        SensorError = 2,
        Panic = 3,
        StateDisabled = 4,
    }
}

/// Free-form log line emitted by the firmware.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct Log {
    #[prost(string, tag = "1")]
    pub msg: String,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Ack {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct GeneralState {
    #[prost(uint64, tag = "1")]
    pub uptime_millis: u64,
    #[prost(bool, tag = "2")]
    pub transient_connection: bool,
    /// Characters printed on the flaps, indexed by flap position.
    #[prost(bytes = "vec", tag = "3")]
    pub flap_character_set: Vec<u8>,
}

/// Target configuration of every module. Nonces are compared by the firmware: bumping
/// `movement_nonce` forces a full rotation, bumping `reset_nonce` re-homes the module.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, PartialEq, prost::Message)]
pub struct SplitflapConfig {
    #[prost(message, repeated, tag = "1")]
    pub modules: Vec<ModuleConfig>,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ModuleConfig {
    #[prost(uint32, tag = "1")]
    pub target_flap_index: u32,
    #[prost(uint32, tag = "2")]
    pub movement_nonce: u32,
    #[prost(uint32, tag = "3")]
    pub reset_nonce: u32,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct RequestState {}

impl ToSplitflap {
    /// Creates a message asking the device for a fresh [`SplitflapState`].
    pub fn request_state(nonce: u32) -> Self {
        Self {
            nonce,
            payload: Some(to_splitflap::Payload::RequestState(RequestState {})),
        }
    }

    /// Creates a message pushing a new [`SplitflapConfig`] to the device.
    pub fn config(nonce: u32, config: SplitflapConfig) -> Self {
        Self {
            nonce,
            payload: Some(to_splitflap::Payload::SplitflapConfig(config)),
        }
    }
}
