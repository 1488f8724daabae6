// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod am824;
pub mod cip;
pub mod cycle_time;
pub mod layout;
pub mod midi;

use glib::{error::ErrorDomain, Quark};

/// Any error in protocol of isochronous packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsochProtocolError {
    /// The CIP header is not formatted as expected.
    MalformedHeader,
    /// The length of packet is shorter than expected.
    ShortPacket,
    /// The dimension of data block is different from the current layout.
    DimensionMismatch,
    /// The combination of sampling rate and optical interface mode is not supported.
    UnsupportedConfiguration,
    Invalid(i32),
}

impl std::fmt::Display for IsochProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            IsochProtocolError::MalformedHeader => "malformed-header",
            IsochProtocolError::ShortPacket => "short-packet",
            IsochProtocolError::DimensionMismatch => "dimension-mismatch",
            IsochProtocolError::UnsupportedConfiguration => "unsupported-configuration",
            IsochProtocolError::Invalid(_) => "invalid",
        };

        write!(f, "IsochProtocolError::{}", msg)
    }
}

impl ErrorDomain for IsochProtocolError {
    fn domain() -> Quark {
        Quark::from_str("firewire-isoch-protocol-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            IsochProtocolError::MalformedHeader => 0,
            IsochProtocolError::ShortPacket => 1,
            IsochProtocolError::DimensionMismatch => 2,
            IsochProtocolError::UnsupportedConfiguration => 3,
            IsochProtocolError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => IsochProtocolError::MalformedHeader,
            1 => IsochProtocolError::ShortPacket,
            2 => IsochProtocolError::DimensionMismatch,
            3 => IsochProtocolError::UnsupportedConfiguration,
            _ => IsochProtocolError::Invalid(code),
        };
        Some(enumeration)
    }
}

/// Any error in streaming of isochronous packet. The value is cheap to copy so that it can be
/// returned from the realtime context without allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsochStreamError {
    /// No space is left to queue the packet.
    Overflow,
    /// No packet is queued.
    Underflow,
    /// The packet is larger than the space to store it.
    TooLarge,
    /// Bus reset occurred and the generation of isochronous context expired.
    BusReset,
    /// The isochronous channel is not available.
    ChannelUnavailable,
    /// The isochronous context fails.
    ContextFailed,
    /// The operation requires the handler to be stopped or running.
    InvalidState,
    Invalid(i32),
}

impl std::fmt::Display for IsochStreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            IsochStreamError::Overflow => "overflow",
            IsochStreamError::Underflow => "underflow",
            IsochStreamError::TooLarge => "too-large",
            IsochStreamError::BusReset => "bus-reset",
            IsochStreamError::ChannelUnavailable => "channel-unavailable",
            IsochStreamError::ContextFailed => "context-failed",
            IsochStreamError::InvalidState => "invalid-state",
            IsochStreamError::Invalid(_) => "invalid",
        };

        write!(f, "IsochStreamError::{}", msg)
    }
}

impl ErrorDomain for IsochStreamError {
    fn domain() -> Quark {
        Quark::from_str("firewire-isoch-stream-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            IsochStreamError::Overflow => 0,
            IsochStreamError::Underflow => 1,
            IsochStreamError::TooLarge => 2,
            IsochStreamError::BusReset => 3,
            IsochStreamError::ChannelUnavailable => 4,
            IsochStreamError::ContextFailed => 5,
            IsochStreamError::InvalidState => 6,
            IsochStreamError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => IsochStreamError::Overflow,
            1 => IsochStreamError::Underflow,
            2 => IsochStreamError::TooLarge,
            3 => IsochStreamError::BusReset,
            4 => IsochStreamError::ChannelUnavailable,
            5 => IsochStreamError::ContextFailed,
            6 => IsochStreamError::InvalidState,
            _ => IsochStreamError::Invalid(code),
        };
        Some(enumeration)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_error_code() {
        assert_eq!(
            Some(IsochProtocolError::DimensionMismatch),
            ErrorDomain::from(2)
        );
        assert_eq!(Some(IsochProtocolError::Invalid(100)), ErrorDomain::from(100));
        assert_eq!(IsochProtocolError::ShortPacket.code(), 1);
    }

    #[test]
    fn stream_error_code() {
        assert_eq!(Some(IsochStreamError::BusReset), ErrorDomain::from(3));
        assert_eq!(IsochStreamError::Underflow.code(), 1);

        let err = glib::Error::new(IsochStreamError::ChannelUnavailable, "busy");
        assert_eq!(
            err.kind::<IsochStreamError>(),
            Some(IsochStreamError::ChannelUnavailable)
        );
    }
}
