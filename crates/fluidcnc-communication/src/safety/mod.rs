//! Outgoing-command safety: the validation gate and the emergency-stop path

pub mod estop;
pub mod gate;

pub use estop::{EstopPanel, EstopReport, LinkKey};
pub use gate::{
    is_locked_motion, parse_words, strip_comments, CommandFixer, FixerVerdict, GatedCommand,
    SafetyGate, Word,
};
