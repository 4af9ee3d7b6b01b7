//! grblHAL protocol support
//!
//! Line framing, response and status parsing, command correlation, the
//! sans-IO protocol core and the async controller built on top of it.

pub mod controller;
pub mod correlator;
pub mod error_decoder;
pub mod framer;
pub mod protocol;
pub mod realtime;
pub mod response_parser;
pub mod status_parser;

pub use controller::{CncController, CoolantCommand, FirmwareInfo, StreamHandle};
pub use correlator::{CommandCorrelator, CommandOrigin, CommandReply, OriginKind, ReplySender};
pub use error_decoder::{alarm_recovery_hint, decode_alarm, decode_error, format_alarm, format_error};
pub use framer::LineFramer;
pub use protocol::{ProtocolCore, ProtocolOptions, SendOutcome};
pub use realtime::{OverrideAdjust, RapidOverride, RealtimeCommand};
pub use response_parser::{GrblResponse, GrblResponseParser, ParserState};
pub use status_parser::{parse_status_report, StatusReport};
