//! Gateway close codes and their recovery classification.

use std::fmt;

/// Close code used when the client wants the server to keep the session.
pub const CLOSE_RESUMABLE: u16 = 4000;

/// Close code used for a normal shutdown that discards the session.
pub const CLOSE_NORMAL: u16 = 1000;

/// A close code received from the gateway or the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: the endpoint is going away.
    GoingAway,
    /// 1005: closed without a status code.
    NoStatus,
    /// 1006: abnormal closure, the transport dropped.
    Abnormal,
    /// 4000: unknown error, reconnect.
    UnknownError,
    /// 4001: an invalid opcode was sent.
    UnknownOpcode,
    /// 4002: an invalid payload was sent.
    DecodeError,
    /// 4003: a payload was sent before identifying.
    NotAuthenticated,
    /// 4004: the token is invalid.
    AuthenticationFailed,
    /// 4005: more than one identify was sent.
    AlreadyAuthenticated,
    /// 4007: the resume sequence was invalid.
    InvalidSeq,
    /// 4008: payloads were sent too quickly.
    RateLimited,
    /// 4009: the session timed out.
    SessionTimedOut,
    /// 4010: the shard in the identify payload was invalid.
    InvalidShard,
    /// 4011: the session would handle too many guilds.
    ShardingRequired,
    /// 4012: invalid gateway version.
    InvalidApiVersion,
    /// 4013: invalid intents.
    InvalidIntents,
    /// 4014: intents the application is not approved for.
    DisallowedIntents,
    /// Any other code.
    Other(u16),
}

impl CloseCode {
    /// Numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::NoStatus => 1005,
            Self::Abnormal => 1006,
            Self::UnknownError => 4000,
            Self::UnknownOpcode => 4001,
            Self::DecodeError => 4002,
            Self::NotAuthenticated => 4003,
            Self::AuthenticationFailed => 4004,
            Self::AlreadyAuthenticated => 4005,
            Self::InvalidSeq => 4007,
            Self::RateLimited => 4008,
            Self::SessionTimedOut => 4009,
            Self::InvalidShard => 4010,
            Self::ShardingRequired => 4011,
            Self::InvalidApiVersion => 4012,
            Self::InvalidIntents => 4013,
            Self::DisallowedIntents => 4014,
            Self::Other(code) => code,
        }
    }

    /// Classify a numeric code.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            4000 => Self::UnknownError,
            4001 => Self::UnknownOpcode,
            4002 => Self::DecodeError,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4007 => Self::InvalidSeq,
            4008 => Self::RateLimited,
            4009 => Self::SessionTimedOut,
            4010 => Self::InvalidShard,
            4011 => Self::ShardingRequired,
            4012 => Self::InvalidApiVersion,
            4013 => Self::InvalidIntents,
            4014 => Self::DisallowedIntents,
            other => Self::Other(other),
        }
    }

    /// Whether reconnecting after this code can never succeed.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    /// Whether the code is not one this client knows about.
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        matches!(self, Self::Other(_))
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        Self::from_u16(code)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::GoingAway => "going away",
            Self::NoStatus => "no status",
            Self::Abnormal => "abnormal closure",
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode",
            Self::DecodeError => "decode error",
            Self::NotAuthenticated => "not authenticated",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSeq => "invalid seq",
            Self::RateLimited => "rate limited",
            Self::SessionTimedOut => "session timed out",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid api version",
            Self::InvalidIntents => "invalid intents",
            Self::DisallowedIntents => "disallowed intents",
            Self::Other(_) => "unrecognised",
        };
        write!(f, "{} ({name})", self.as_u16())
    }
}
