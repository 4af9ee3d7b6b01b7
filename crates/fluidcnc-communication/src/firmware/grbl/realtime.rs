//! Single-byte realtime commands
//!
//! Realtime bytes are picked out of the serial stream by the firmware as soon
//! as they arrive. They bypass the planner and produce no `ok`/`error` reply,
//! so they are never correlated and never count against the receive buffer.

use std::fmt;

/// A realtime command byte accepted by grblHAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealtimeCommand {
    /// `?` status report request
    StatusReport,
    /// `~` cycle start / resume
    CycleStart,
    /// `!` feed hold
    FeedHold,
    /// 0x18 soft reset (Ctrl-X)
    SoftReset,
    /// 0x84 safety door
    SafetyDoor,
    /// 0x85 jog cancel
    JogCancel,
    /// 0x90 feed override 100%
    FeedOverrideReset,
    /// 0x91 feed override +10%
    FeedOverrideCoarsePlus,
    /// 0x92 feed override -10%
    FeedOverrideCoarseMinus,
    /// 0x93 feed override +1%
    FeedOverrideFinePlus,
    /// 0x94 feed override -1%
    FeedOverrideFineMinus,
    /// 0x95 rapid override 100%
    RapidOverrideFull,
    /// 0x96 rapid override 50%
    RapidOverrideMedium,
    /// 0x97 rapid override 25%
    RapidOverrideLow,
    /// 0x99 spindle override 100%
    SpindleOverrideReset,
    /// 0x9A spindle override +10%
    SpindleOverrideCoarsePlus,
    /// 0x9B spindle override -10%
    SpindleOverrideCoarseMinus,
    /// 0x9C spindle override +1%
    SpindleOverrideFinePlus,
    /// 0x9D spindle override -1%
    SpindleOverrideFineMinus,
    /// 0x9E spindle stop toggle (only in Hold)
    SpindleStopToggle,
    /// 0xA0 flood coolant toggle
    FloodToggle,
    /// 0xA1 mist coolant toggle
    MistToggle,
}

impl RealtimeCommand {
    /// Every accepted realtime command
    pub const ALL: [RealtimeCommand; 22] = [
        Self::StatusReport,
        Self::CycleStart,
        Self::FeedHold,
        Self::SoftReset,
        Self::SafetyDoor,
        Self::JogCancel,
        Self::FeedOverrideReset,
        Self::FeedOverrideCoarsePlus,
        Self::FeedOverrideCoarseMinus,
        Self::FeedOverrideFinePlus,
        Self::FeedOverrideFineMinus,
        Self::RapidOverrideFull,
        Self::RapidOverrideMedium,
        Self::RapidOverrideLow,
        Self::SpindleOverrideReset,
        Self::SpindleOverrideCoarsePlus,
        Self::SpindleOverrideCoarseMinus,
        Self::SpindleOverrideFinePlus,
        Self::SpindleOverrideFineMinus,
        Self::SpindleStopToggle,
        Self::FloodToggle,
        Self::MistToggle,
    ];

    /// Wire byte
    pub const fn byte(self) -> u8 {
        match self {
            Self::StatusReport => b'?',
            Self::CycleStart => b'~',
            Self::FeedHold => b'!',
            Self::SoftReset => 0x18,
            Self::SafetyDoor => 0x84,
            Self::JogCancel => 0x85,
            Self::FeedOverrideReset => 0x90,
            Self::FeedOverrideCoarsePlus => 0x91,
            Self::FeedOverrideCoarseMinus => 0x92,
            Self::FeedOverrideFinePlus => 0x93,
            Self::FeedOverrideFineMinus => 0x94,
            Self::RapidOverrideFull => 0x95,
            Self::RapidOverrideMedium => 0x96,
            Self::RapidOverrideLow => 0x97,
            Self::SpindleOverrideReset => 0x99,
            Self::SpindleOverrideCoarsePlus => 0x9A,
            Self::SpindleOverrideCoarseMinus => 0x9B,
            Self::SpindleOverrideFinePlus => 0x9C,
            Self::SpindleOverrideFineMinus => 0x9D,
            Self::SpindleStopToggle => 0x9E,
            Self::FloodToggle => 0xA0,
            Self::MistToggle => 0xA1,
        }
    }

    /// Look up a wire byte; `None` for bytes outside the whitelist
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.byte() == byte)
    }

    /// Recognise a command string that consists of exactly one realtime
    /// character (`"?"`, `"!"`, `"\u{18}"`, `"\u{85}"`, ...)
    pub fn parse(command: &str) -> Option<Self> {
        let mut chars = command.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        u8::try_from(u32::from(c)).ok().and_then(Self::from_byte)
    }
}

impl fmt::Display for RealtimeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.byte() {
            b @ (b'?' | b'~' | b'!') => write!(f, "{}", b as char),
            b => write!(f, "0x{:02X}", b),
        }
    }
}

/// Override adjustment requested through the command API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideAdjust {
    /// Back to 100%
    Reset,
    /// +10%
    CoarsePlus,
    /// -10%
    CoarseMinus,
    /// +1%
    FinePlus,
    /// -1%
    FineMinus,
}

impl OverrideAdjust {
    /// Realtime command for a feed override adjustment
    pub fn feed(self) -> RealtimeCommand {
        match self {
            Self::Reset => RealtimeCommand::FeedOverrideReset,
            Self::CoarsePlus => RealtimeCommand::FeedOverrideCoarsePlus,
            Self::CoarseMinus => RealtimeCommand::FeedOverrideCoarseMinus,
            Self::FinePlus => RealtimeCommand::FeedOverrideFinePlus,
            Self::FineMinus => RealtimeCommand::FeedOverrideFineMinus,
        }
    }

    /// Realtime command for a spindle override adjustment
    pub fn spindle(self) -> RealtimeCommand {
        match self {
            Self::Reset => RealtimeCommand::SpindleOverrideReset,
            Self::CoarsePlus => RealtimeCommand::SpindleOverrideCoarsePlus,
            Self::CoarseMinus => RealtimeCommand::SpindleOverrideCoarseMinus,
            Self::FinePlus => RealtimeCommand::SpindleOverrideFinePlus,
            Self::FineMinus => RealtimeCommand::SpindleOverrideFineMinus,
        }
    }
}

/// Rapid override levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RapidOverride {
    /// 100%
    Full,
    /// 50%
    Medium,
    /// 25%
    Low,
}

impl RapidOverride {
    /// Realtime command for this level
    pub fn command(self) -> RealtimeCommand {
        match self {
            Self::Full => RealtimeCommand::RapidOverrideFull,
            Self::Medium => RealtimeCommand::RapidOverrideMedium,
            Self::Low => RealtimeCommand::RapidOverrideLow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip_for_whitelist() {
        for cmd in RealtimeCommand::ALL {
            assert_eq!(RealtimeCommand::from_byte(cmd.byte()), Some(cmd));
        }
    }

    #[test]
    fn test_non_whitelisted_bytes_rejected() {
        assert_eq!(RealtimeCommand::from_byte(b'G'), None);
        assert_eq!(RealtimeCommand::from_byte(0x98), None);
        assert_eq!(RealtimeCommand::from_byte(0x00), None);
    }

    #[test]
    fn test_parse_single_char_commands() {
        assert_eq!(RealtimeCommand::parse("?"), Some(RealtimeCommand::StatusReport));
        assert_eq!(RealtimeCommand::parse("!"), Some(RealtimeCommand::FeedHold));
        assert_eq!(RealtimeCommand::parse("\u{18}"), Some(RealtimeCommand::SoftReset));
        assert_eq!(RealtimeCommand::parse("\u{85}"), Some(RealtimeCommand::JogCancel));
        assert_eq!(RealtimeCommand::parse("??"), None);
        assert_eq!(RealtimeCommand::parse("$X"), None);
        assert_eq!(RealtimeCommand::parse(""), None);
    }

    #[test]
    fn test_override_mapping() {
        assert_eq!(OverrideAdjust::CoarsePlus.feed().byte(), 0x91);
        assert_eq!(OverrideAdjust::FineMinus.spindle().byte(), 0x9D);
        assert_eq!(RapidOverride::Low.command().byte(), 0x97);
    }
}
