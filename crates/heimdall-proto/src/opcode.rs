//! Gateway opcodes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation code carried in the `op` field of every gateway frame.
///
/// Codes this client does not know about are kept as [`OpCode::Unknown`]
/// so a newer server never makes a frame undecodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OpCode {
    /// An event was dispatched.
    Dispatch,
    /// Heartbeat, sent by the client periodically or requested by the server.
    Heartbeat,
    /// Start a new session.
    Identify,
    /// Update the client's presence.
    PresenceUpdate,
    /// Join, leave or move between voice channels.
    VoiceStateUpdate,
    /// Resume a previous session.
    Resume,
    /// The server asks the client to reconnect and resume.
    Reconnect,
    /// Request guild member chunks.
    RequestGuildMembers,
    /// The session is invalid; payload says whether it can be resumed.
    InvalidSession,
    /// First frame after connecting, carries the heartbeat interval.
    Hello,
    /// Acknowledges a heartbeat.
    HeartbeatAck,
    /// Any other code.
    Unknown(u8),
}

impl OpCode {
    /// The numeric wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
            Self::Unknown(code) => code,
        }
    }

    /// Map a numeric wire value to an opcode.
    #[must_use]
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }
}

impl From<u8> for OpCode {
    fn from(code: u8) -> Self {
        Self::from_u8(code)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op.as_u8()
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch => f.write_str("DISPATCH"),
            Self::Heartbeat => f.write_str("HEARTBEAT"),
            Self::Identify => f.write_str("IDENTIFY"),
            Self::PresenceUpdate => f.write_str("PRESENCE_UPDATE"),
            Self::VoiceStateUpdate => f.write_str("VOICE_STATE_UPDATE"),
            Self::Resume => f.write_str("RESUME"),
            Self::Reconnect => f.write_str("RECONNECT"),
            Self::RequestGuildMembers => f.write_str("REQUEST_GUILD_MEMBERS"),
            Self::InvalidSession => f.write_str("INVALID_SESSION"),
            Self::Hello => f.write_str("HELLO"),
            Self::HeartbeatAck => f.write_str("HEARTBEAT_ACK"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}
