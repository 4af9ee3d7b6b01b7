//! grblHAL status report parsing
//!
//! Parses the pipe-delimited body of a `<...>` status report into a
//! [`StatusReport`] and applies it to the [`MachineState`] model. Numeric
//! fields that fail to parse degrade to 0 and never become NaN.

use fluidcnc_core::{
    BufferState, MachineState, MachineStatus, Overrides, Position, SpindleDirection,
};
use serde::{Deserialize, Serialize};

/// Accessory flags from `A:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Accessories {
    /// Spindle direction (`S` clockwise, `C` counter-clockwise)
    pub spindle: SpindleDirection,
    /// Flood coolant (`F`)
    pub flood: bool,
    /// Mist coolant (`M`)
    pub mist: bool,
}

impl Accessories {
    /// Parse the flag letters of an `A:` field
    pub fn parse(flags: &str) -> Self {
        let mut acc = Self::default();
        for c in flags.chars() {
            match c {
                'S' => acc.spindle = SpindleDirection::Clockwise,
                'C' => acc.spindle = SpindleDirection::CounterClockwise,
                'F' => acc.flood = true,
                'M' => acc.mist = true,
                _ => {}
            }
        }
        acc
    }
}

/// One parsed status report. Absent fields are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    /// Machine status
    pub status: MachineStatus,
    /// Sub-state code
    pub substate: Option<u8>,
    /// `MPos:`
    pub machine_position: Option<Position>,
    /// `WPos:`
    pub work_position: Option<Position>,
    /// `WCO:`
    pub work_offset: Option<Position>,
    /// `Bf:`/`Buf:`
    pub buffer: Option<BufferState>,
    /// Feed from `FS:` or `F:`
    pub feed_rate: Option<f64>,
    /// Spindle speed from `FS:`
    pub spindle_speed: Option<f64>,
    /// `Ov:`
    pub overrides: Option<Overrides>,
    /// `A:`
    pub accessories: Option<Accessories>,
    /// `Pn:`
    pub pins: Option<String>,
    /// `Ln:`
    pub line_number: Option<u32>,
    /// `T:`
    pub tool: Option<u32>,
    /// `SG:`
    pub stepper_load: Option<Position>,
}

/// Parse a number, degrading anything unparseable or non-finite to 0
pub fn parse_number(text: &str) -> f64 {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn parse_values(text: &str) -> Vec<f64> {
    text.split(',').map(parse_number).collect()
}

/// Parse an `x,y,z[,...]` triple; missing axes read as 0
pub fn parse_position(text: &str) -> Position {
    let values = parse_values(text);
    let at = |i: usize| values.get(i).copied().unwrap_or(0.0);
    Position::new(at(0), at(1), at(2))
}

fn parse_percent(value: f64) -> u16 {
    value.clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Parse the inside of `<...>` (without the angle brackets)
pub fn parse_status_report(body: &str) -> StatusReport {
    let mut fields = body.split('|');
    let state_field = fields.next().unwrap_or_default().trim();

    let mut report = StatusReport {
        status: MachineStatus::from_report(state_field),
        substate: state_field
            .split_once(':')
            .and_then(|(_, sub)| sub.trim().parse::<u8>().ok()),
        ..Default::default()
    };

    for field in fields {
        let Some((key, value)) = field.split_once(':') else {
            tracing::trace!("Ignoring status field without value: {}", field);
            continue;
        };
        match key.trim() {
            "MPos" => report.machine_position = Some(parse_position(value)),
            "WPos" => report.work_position = Some(parse_position(value)),
            "WCO" => report.work_offset = Some(parse_position(value)),
            "Bf" | "Buf" => {
                let values: Vec<f64> = value.split([',', ':']).map(parse_number).collect();
                report.buffer = Some(BufferState {
                    planner_slots: parse_percent(values.first().copied().unwrap_or(0.0)),
                    rx_bytes: parse_percent(values.get(1).copied().unwrap_or(0.0)),
                });
            }
            "FS" => {
                let values = parse_values(value);
                report.feed_rate = Some(values.first().copied().unwrap_or(0.0));
                report.spindle_speed = Some(values.get(1).copied().unwrap_or(0.0));
            }
            "F" => report.feed_rate = Some(parse_number(value)),
            "Ov" => {
                let values = parse_values(value);
                let at = |i: usize| parse_percent(values.get(i).copied().unwrap_or(100.0));
                report.overrides = Some(Overrides {
                    feed: at(0),
                    rapid: at(1),
                    spindle: at(2),
                });
            }
            "A" => report.accessories = Some(Accessories::parse(value.trim())),
            "Pn" => report.pins = Some(value.trim().to_string()),
            "Ln" => report.line_number = value.trim().parse::<u32>().ok(),
            "T" => report.tool = Some(parse_number(value).max(0.0) as u32),
            "SG" => report.stepper_load = Some(parse_position(value)),
            other => tracing::trace!("Ignoring status field {}", other),
        }
    }

    report
}

/// Apply a report to the machine model. Positions are cross-derived through
/// the work offset so `wpos == mpos - wco` always holds afterwards.
pub fn apply_status(state: &mut MachineState, report: &StatusReport) {
    state.status = report.status;
    state.substate = report.substate;

    if let Some(wco) = report.work_offset {
        state.set_work_offset(wco);
    }
    match (report.machine_position, report.work_position) {
        (Some(mpos), _) => state.set_machine_position(mpos),
        (None, Some(wpos)) => state.set_work_position(wpos),
        (None, None) => {}
    }

    if let Some(feed) = report.feed_rate {
        state.feed_rate = feed;
    }
    if let Some(speed) = report.spindle_speed {
        state.spindle_speed = speed;
    }
    if let Some(buffer) = report.buffer {
        state.buffer = buffer;
    }

    // The controller only sends A: while something is on, and only in the
    // reports that carry Ov:, so Ov: without A: means every accessory is off.
    let accessories = match (report.overrides, report.accessories) {
        (_, Some(acc)) => Some(acc),
        (Some(_), None) => Some(Accessories::default()),
        (None, None) => None,
    };
    if let Some(ov) = report.overrides {
        state.overrides = ov;
    }
    if let Some(acc) = accessories {
        state.spindle = acc.spindle;
        state.coolant.flood = acc.flood;
        state.coolant.mist = acc.mist;
    }

    state.pins = report.pins.clone().unwrap_or_default();
    state.line_number = report.line_number;
    if let Some(tool) = report.tool {
        state.tool = tool;
    }
    if report.stepper_load.is_some() {
        state.stepper_load = report.stepper_load;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idle_report() {
        let report = parse_status_report("Idle|MPos:10.000,5.000,-1.000|FS:0,0");
        assert_eq!(report.status, MachineStatus::Idle);
        assert_eq!(report.machine_position, Some(Position::new(10.0, 5.0, -1.0)));
        assert_eq!(report.feed_rate, Some(0.0));
        assert_eq!(report.spindle_speed, Some(0.0));
    }

    #[test]
    fn test_substate_and_unknown_state() {
        let report = parse_status_report("Hold:1|MPos:0,0,0");
        assert_eq!(report.status, MachineStatus::Hold);
        assert_eq!(report.substate, Some(1));
        assert_eq!(parse_status_report("Warp|MPos:0,0,0").status, MachineStatus::Unknown);
    }

    #[test]
    fn test_malformed_numbers_degrade_to_zero() {
        let report = parse_status_report("Run|MPos:abc,NaN,3|FS:x,inf");
        assert_eq!(report.machine_position, Some(Position::new(0.0, 0.0, 3.0)));
        assert_eq!(report.feed_rate, Some(0.0));
        assert_eq!(report.spindle_speed, Some(0.0));
    }

    #[test]
    fn test_full_field_set() {
        let report = parse_status_report(
            "Run|MPos:1,2,3|Bf:15,128|FS:500,12000|Ov:110,50,90|A:SF|Pn:XZ|Ln:42|T:3|SG:10,20,30",
        );
        assert_eq!(
            report.buffer,
            Some(BufferState {
                planner_slots: 15,
                rx_bytes: 128
            })
        );
        assert_eq!(
            report.overrides,
            Some(Overrides {
                feed: 110,
                rapid: 50,
                spindle: 90
            })
        );
        let acc = report.accessories.expect("accessories");
        assert_eq!(acc.spindle, SpindleDirection::Clockwise);
        assert!(acc.flood);
        assert!(!acc.mist);
        assert_eq!(report.pins.as_deref(), Some("XZ"));
        assert_eq!(report.line_number, Some(42));
        assert_eq!(report.tool, Some(3));
        assert_eq!(report.stepper_load, Some(Position::new(10.0, 20.0, 30.0)));
    }

    #[test]
    fn test_apply_derives_work_position() {
        let mut state = MachineState::new();
        apply_status(&mut state, &parse_status_report("Idle|MPos:10,5,-1|WCO:2,1,-3"));
        assert_eq!(state.work_position, Position::new(8.0, 4.0, 2.0));

        // Later reports without WCO keep the cached offset
        apply_status(&mut state, &parse_status_report("Run|MPos:12,5,-1"));
        assert_eq!(state.work_position, Position::new(10.0, 4.0, 2.0));
        assert!(state.positions_consistent());
    }

    #[test]
    fn test_apply_derives_machine_position_from_wpos() {
        let mut state = MachineState::new();
        state.set_work_offset(Position::new(1.0, 1.0, 1.0));
        apply_status(&mut state, &parse_status_report("Idle|WPos:0,0,0"));
        assert_eq!(state.machine_position, Position::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn test_overrides_without_accessories_turn_them_off() {
        let mut state = MachineState::new();
        apply_status(&mut state, &parse_status_report("Run|MPos:0,0,0|Ov:100,100,100|A:CM"));
        assert_eq!(state.spindle, SpindleDirection::CounterClockwise);
        assert!(state.coolant.mist);

        apply_status(&mut state, &parse_status_report("Run|MPos:0,0,0|Ov:100,100,100"));
        assert_eq!(state.spindle, SpindleDirection::Off);
        assert!(!state.coolant.mist);
    }
}
