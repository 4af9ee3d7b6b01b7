//! grblHAL response classifier
//!
//! Classifies each complete protocol line: status reports, `ok`, `error:N`,
//! `ALARM:N`, probe results, setting echoes, parser state, welcome banners,
//! feedback messages and JSON-wrapped auxiliary payloads.

use fluidcnc_core::{ProbeResult, ProtocolError};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error_decoder::{format_alarm, format_error};
use super::status_parser::{parse_position, parse_status_report, StatusReport};

/// Active modal state from `[GC:...]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserState {
    /// Active work coordinate system (`G54`..`G59.3`)
    pub wcs: Option<String>,
    /// Active tool
    pub tool: Option<u32>,
    /// Every modal word, in report order
    pub words: Vec<String>,
}

impl ParserState {
    fn parse(body: &str) -> Self {
        let words: Vec<String> = body.split_whitespace().map(str::to_string).collect();
        let wcs = words
            .iter()
            .find(|w| w.starts_with("G5") && w.len() >= 3 && *w != "G53")
            .cloned();
        let tool = words
            .iter()
            .find_map(|w| w.strip_prefix('T'))
            .and_then(|t| t.parse::<u32>().ok());
        Self { wcs, tool, words }
    }
}

/// grblHAL response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GrblResponse {
    /// OK acknowledgment
    Ok,
    /// Error response with error code
    Error(u32),
    /// Alarm response with alarm code
    Alarm(u32),
    /// Status report
    Status(StatusReport),
    /// Probe result (`[PRB:x,y,z:flag]`)
    Probe(ProbeResult),
    /// Setting echo (`$n=value`)
    Setting {
        /// Setting number
        number: u16,
        /// Raw value
        value: String,
    },
    /// Parser state (`[GC:...]`)
    ParserState(ParserState),
    /// Welcome banner, sent after every reset
    Welcome(String),
    /// `[MSG:...]` feedback text
    Feedback(String),
    /// `[VER:...]` firmware version from `$I`
    Version(String),
    /// `[OPT:...]` compile-time options from `$I`
    BuildOptions(String),
    /// JSON object passed through to collaborators
    Auxiliary(serde_json::Value),
    /// Anything else
    Message(String),
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error(code) => write!(f, "{}", format_error(*code)),
            Self::Alarm(code) => write!(f, "{}", format_alarm(*code)),
            Self::Status(report) => write!(f, "status:{}", report.status),
            Self::Probe(probe) => write!(f, "probe:{}:{}", probe.position, probe.success),
            Self::Setting { number, value } => write!(f, "setting:${}={}", number, value),
            Self::ParserState(state) => write!(f, "parser_state:{}", state.words.join(" ")),
            Self::Welcome(banner) => write!(f, "welcome:{}", banner),
            Self::Feedback(msg) => write!(f, "feedback:{}", msg),
            Self::Version(version) => write!(f, "version:{}", version),
            Self::BuildOptions(options) => write!(f, "options:{}", options),
            Self::Auxiliary(value) => write!(f, "auxiliary:{}", value),
            Self::Message(msg) => write!(f, "message:{}", msg),
        }
    }
}

fn unparseable(line: &str, reason: &str) -> ProtocolError {
    ProtocolError::Unparseable {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

/// `prefix` must be ASCII; never splits a multi-byte character
fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

/// grblHAL response parser
#[derive(Debug, Default)]
pub struct GrblResponseParser;

impl GrblResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        Self
    }

    /// Classify one line. Blank lines yield `Ok(None)`; lines that look like a
    /// known response but are malformed yield a [`ProtocolError`].
    pub fn parse(&self, line: &str) -> Result<Option<GrblResponse>, ProtocolError> {
        let line = line.trim();

        if line.is_empty() {
            return Ok(None);
        }

        if line == "ok" {
            return Ok(Some(GrblResponse::Ok));
        }

        if let Some(code) = line.strip_prefix("error:") {
            return code
                .trim()
                .parse::<u32>()
                .map(|c| Some(GrblResponse::Error(c)))
                .map_err(|_| unparseable(line, "bad error code"));
        }

        if let Some(code) = strip_prefix_ignore_case(line, "ALARM:") {
            return code
                .trim()
                .parse::<u32>()
                .map(|c| Some(GrblResponse::Alarm(c)))
                .map_err(|_| unparseable(line, "bad alarm code"));
        }

        if let Some(body) = line.strip_prefix('<') {
            let body = body
                .strip_suffix('>')
                .ok_or_else(|| unparseable(line, "unterminated status report"))?;
            return Ok(Some(GrblResponse::Status(parse_status_report(body))));
        }

        if let Some(body) = line.strip_prefix('[') {
            let body = body
                .strip_suffix(']')
                .ok_or_else(|| unparseable(line, "unterminated bracket message"))?;
            return self.parse_bracketed(line, body).map(Some);
        }

        if let Some(setting) = line.strip_prefix('$') {
            if let Some((number, value)) = setting.split_once('=') {
                if let Ok(number) = number.trim().parse::<u16>() {
                    return Ok(Some(GrblResponse::Setting {
                        number,
                        value: value.trim().to_string(),
                    }));
                }
            }
        }

        if line.starts_with("Grbl ") || line.starts_with("GrblHAL ") {
            return Ok(Some(GrblResponse::Welcome(line.to_string())));
        }

        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(line) {
                return Ok(Some(GrblResponse::Auxiliary(value)));
            }
        }

        Ok(Some(GrblResponse::Message(line.to_string())))
    }

    fn parse_bracketed(&self, line: &str, body: &str) -> Result<GrblResponse, ProtocolError> {
        if let Some(probe) = body.strip_prefix("PRB:") {
            let (coords, flag) = probe
                .rsplit_once(':')
                .ok_or_else(|| unparseable(line, "probe result without flag"))?;
            let success = match flag.trim() {
                "1" => true,
                "0" => false,
                _ => return Err(unparseable(line, "bad probe flag")),
            };
            return Ok(GrblResponse::Probe(ProbeResult {
                position: parse_position(coords),
                success,
            }));
        }

        if let Some(modal) = body.strip_prefix("GC:") {
            return Ok(GrblResponse::ParserState(ParserState::parse(modal)));
        }

        if let Some(msg) = body.strip_prefix("MSG:") {
            return Ok(GrblResponse::Feedback(msg.trim().to_string()));
        }

        if let Some(version) = body.strip_prefix("VER:") {
            return Ok(GrblResponse::Version(
                version.trim_end_matches(':').trim().to_string(),
            ));
        }

        if let Some(options) = body.strip_prefix("OPT:") {
            return Ok(GrblResponse::BuildOptions(options.trim().to_string()));
        }

        Ok(GrblResponse::Message(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidcnc_core::Position;

    #[test]
    fn test_parse_probe() {
        let parser = GrblResponseParser::new();
        let response = parser.parse("[PRB:1.000,2.000,-3.500:1]").expect("valid");
        assert_eq!(
            response,
            Some(GrblResponse::Probe(ProbeResult {
                position: Position::new(1.0, 2.0, -3.5),
                success: true
            }))
        );
    }

    #[test]
    fn test_parser_state() {
        let parser = GrblResponseParser::new();
        match parser.parse("[GC:G0 G55 G17 G21 G90 G94 M5 M9 T4 F0 S0]") {
            Ok(Some(GrblResponse::ParserState(state))) => {
                assert_eq!(state.wcs.as_deref(), Some("G55"));
                assert_eq!(state.tool, Some(4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        let parser = GrblResponseParser::new();
        assert!(parser.parse("error:abc").is_err());
        assert!(parser.parse("<Idle|MPos:0,0,0").is_err());
        assert!(parser.parse("[PRB:1,2,3]").is_err());
    }

    #[test]
    fn test_json_only_when_object() {
        let parser = GrblResponseParser::new();
        assert!(matches!(
            parser.parse(r#"{"type":"bridge_status","serial":"connected"}"#),
            Ok(Some(GrblResponse::Auxiliary(_)))
        ));
        assert!(matches!(
            parser.parse("{not json}"),
            Ok(Some(GrblResponse::Message(_)))
        ));
    }
}
