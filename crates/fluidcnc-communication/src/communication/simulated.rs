//! Simulated controller
//!
//! An in-process grblHAL stand-in for demos and tests. Motion is instant:
//! a G0/G1 target is reached by the time `ok` is sent.

use async_trait::async_trait;
use fluidcnc_core::{Axis, ConnectionError, MachineStatus, Position, TransportKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Inbound, LinkWriter, Transport, TransportLink};
use crate::firmware::connection_watch::ActivityClock;
use crate::firmware::grbl::realtime::RealtimeCommand;
use crate::firmware::grbl::status_parser::parse_number;

/// Banner sent after every reset
pub const SIMULATED_BANNER: &str = "GrblHAL 1.1f ['$' or '$HELP' for help]";

/// `$I` build info
const BUILD_INFO: [&str; 2] = ["[VER:1.1f.20240131:simulated]", "[OPT:VNMSL,35,1024]"];

const SETTINGS: &[(u16, &str)] = &[
    (0, "10"),
    (1, "25"),
    (22, "1"),
    (110, "5000.000"),
    (111, "5000.000"),
    (112, "1000.000"),
    (130, "300.000"),
    (131, "200.000"),
    (132, "80.000"),
];

/// Firmware model behind the simulated link
#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    status: MachineStatus,
    position: Position,
    work_offset: Position,
    feed_rate: f64,
    spindle_speed: f64,
    relative: bool,
    settings: BTreeMap<u16, String>,
}

impl Default for SimulatedMachine {
    fn default() -> Self {
        Self {
            status: MachineStatus::Idle,
            position: Position::default(),
            work_offset: Position::default(),
            feed_rate: 0.0,
            spindle_speed: 0.0,
            relative: false,
            settings: SETTINGS
                .iter()
                .map(|(n, v)| (*n, v.to_string()))
                .collect(),
        }
    }
}

impl SimulatedMachine {
    /// Current machine position
    pub fn position(&self) -> Position {
        self.position
    }

    /// Current status
    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// Force an alarm, as a limit switch would
    pub fn trigger_alarm(&mut self, code: u32) -> Vec<String> {
        self.status = MachineStatus::Alarm;
        vec![format!("ALARM:{}", code)]
    }

    fn status_report(&self) -> String {
        let p = self.position;
        let w = self.work_offset;
        format!(
            "<{}|MPos:{:.3},{:.3},{:.3}|Bf:100,128|FS:{:.0},{:.0}|WCO:{:.3},{:.3},{:.3}>",
            self.status, p.x, p.y, p.z, self.feed_rate, self.spindle_speed, w.x, w.y, w.z
        )
    }

    /// Words of a G-code line as (letter, value)
    fn words(line: &str) -> Vec<(char, f64)> {
        let mut words = Vec::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if !c.is_ascii_alphabetic() {
                continue;
            }
            let mut number = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_digit() || n == '.' || n == '-' || n == '+' {
                    number.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            words.push((c.to_ascii_uppercase(), parse_number(&number)));
        }
        words
    }

    fn apply_motion(&mut self, words: &[(char, f64)], relative: bool) -> Position {
        let mut target = self.position;
        for (letter, value) in words {
            if let Some(axis) = Axis::from_letter(*letter) {
                let current = target.get(axis);
                let next = if relative { current + value } else { *value };
                target = target.with(axis, next);
            }
        }
        target
    }

    /// Handle one line and return the controller's replies
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();
        let upper = line.to_ascii_uppercase();

        if upper == "$$" {
            let mut replies: Vec<String> = self
                .settings
                .iter()
                .map(|(n, v)| format!("${}={}", n, v))
                .collect();
            replies.push("ok".to_string());
            return replies;
        }
        if upper == "$I" {
            let mut replies: Vec<String> = BUILD_INFO.iter().map(|s| s.to_string()).collect();
            replies.push("ok".to_string());
            return replies;
        }
        if let Some(setting) = line.strip_prefix('$') {
            if let Some((number, value)) = setting.split_once('=') {
                if let Ok(number) = number.trim().parse::<u16>() {
                    self.settings.insert(number, value.trim().to_string());
                    return vec!["ok".to_string()];
                }
            } else if let Ok(number) = setting.trim().parse::<u16>() {
                return match self.settings.get(&number) {
                    Some(value) => vec![format!("${}={}", number, value), "ok".to_string()],
                    None => vec!["error:3".to_string()],
                };
            }
        }
        if upper == "$G" {
            return vec![
                format!(
                    "[GC:G0 G54 G17 G21 {} G94 M5 M9 T0 F{:.0} S{:.0}]",
                    if self.relative { "G91" } else { "G90" },
                    self.feed_rate,
                    self.spindle_speed
                ),
                "ok".to_string(),
            ];
        }
        if upper.starts_with("$H") {
            self.position = Position::default();
            self.status = MachineStatus::Idle;
            return vec!["ok".to_string()];
        }
        if upper == "$X" {
            self.status = MachineStatus::Idle;
            return vec!["[MSG:Caution: Unlocked]".to_string(), "ok".to_string()];
        }
        if upper.starts_with('$') && !upper.starts_with("$J=") {
            return vec!["ok".to_string()];
        }
        if self.status == MachineStatus::Alarm {
            return vec!["error:9".to_string()];
        }

        if let Some(jog) = upper.strip_prefix("$J=") {
            let words = Self::words(jog);
            let relative = words.iter().any(|(l, v)| *l == 'G' && (*v - 91.0).abs() < f64::EPSILON);
            self.position = self.apply_motion(&words, relative);
            return vec!["ok".to_string()];
        }

        let words = Self::words(&upper);
        for (letter, value) in &words {
            match (letter, *value) {
                ('G', v) if (v - 90.0).abs() < f64::EPSILON => self.relative = false,
                ('G', v) if (v - 91.0).abs() < f64::EPSILON => self.relative = true,
                ('F', v) => self.feed_rate = v,
                ('S', v) => self.spindle_speed = v,
                ('M', v) if (v - 5.0).abs() < f64::EPSILON => self.spindle_speed = 0.0,
                _ => {}
            }
        }

        let probing = upper.contains("G38");
        let target = self.apply_motion(&words, self.relative);
        self.position = target;
        if probing {
            return vec![
                format!(
                    "[PRB:{:.3},{:.3},{:.3}:1]",
                    target.x, target.y, target.z
                ),
                "ok".to_string(),
            ];
        }
        vec!["ok".to_string()]
    }

    /// Handle one realtime byte
    pub fn handle_realtime(&mut self, command: RealtimeCommand) -> Vec<String> {
        match command {
            RealtimeCommand::StatusReport => vec![self.status_report()],
            RealtimeCommand::FeedHold => {
                if matches!(self.status, MachineStatus::Idle | MachineStatus::Run) {
                    self.status = MachineStatus::Hold;
                }
                Vec::new()
            }
            RealtimeCommand::CycleStart => {
                if self.status == MachineStatus::Hold {
                    self.status = MachineStatus::Idle;
                }
                Vec::new()
            }
            RealtimeCommand::SoftReset => {
                if self.status != MachineStatus::Alarm {
                    self.status = MachineStatus::Idle;
                }
                vec![SIMULATED_BANNER.to_string()]
            }
            _ => Vec::new(),
        }
    }
}

/// Transport backed by [`SimulatedMachine`]
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    machine: Arc<Mutex<SimulatedMachine>>,
}

impl SimulatedTransport {
    /// Create a fresh simulated controller
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the firmware model
    pub fn machine(&self) -> Arc<Mutex<SimulatedMachine>> {
        Arc::clone(&self.machine)
    }
}

struct SimulatedWriter {
    machine: Arc<Mutex<SimulatedMachine>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    activity: ActivityClock,
    open: AtomicBool,
}

impl SimulatedWriter {
    fn reply(&self, lines: Vec<String>) -> Result<(), ConnectionError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut text = lines.join("\n");
        text.push('\n');
        self.activity.touch();
        self.inbound
            .send(Inbound::Text(text))
            .map_err(|_| ConnectionError::WriteFailed {
                endpoint: "simulated".to_string(),
                reason: "reader gone".to_string(),
            })
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }
}

impl LinkWriter for SimulatedWriter {
    fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        tracing::trace!("TX {}", line);
        let replies = self.machine.lock().handle_line(line);
        self.reply(replies)
    }

    fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let replies = self.machine.lock().handle_realtime(command);
        self.reply(replies)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(Inbound::Closed {
                clean: true,
                reason: "closed locally".to_string(),
            });
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        "simulated".to_string()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn endpoint(&self) -> String {
        "simulated".to_string()
    }

    async fn connect(&self) -> Result<TransportLink, ConnectionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = ActivityClock::new();
        let writer = SimulatedWriter {
            machine: Arc::clone(&self.machine),
            inbound: tx,
            activity: activity.clone(),
            open: AtomicBool::new(true),
        };
        writer.reply(vec![SIMULATED_BANNER.to_string()])?;
        Ok(TransportLink {
            writer: Arc::new(writer),
            inbound: rx,
            activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_and_relative_moves() {
        let mut machine = SimulatedMachine::default();
        assert_eq!(machine.handle_line("G0 X10 Y5"), vec!["ok"]);
        assert_eq!(machine.position(), Position::new(10.0, 5.0, 0.0));
        machine.handle_line("G91");
        machine.handle_line("G1 X-2 F100");
        assert_eq!(machine.position(), Position::new(8.0, 5.0, 0.0));
        machine.handle_line("$J=G91 G21 Z-1.500 F500");
        assert_eq!(machine.position(), Position::new(8.0, 5.0, -1.5));
    }

    #[test]
    fn test_settings_and_probe() {
        let mut machine = SimulatedMachine::default();
        let replies = machine.handle_line("$$");
        assert!(replies.contains(&"$130=300.000".to_string()));
        assert_eq!(replies.last().map(String::as_str), Some("ok"));

        let replies = machine.handle_line("G91 G38.2 Z-5 F100");
        assert_eq!(replies[0], "[PRB:0.000,0.000,-5.000:1]");
    }

    #[test]
    fn test_setting_write_and_query() {
        let mut machine = SimulatedMachine::default();
        assert_eq!(machine.handle_line("$140=2000"), vec!["ok"]);
        assert_eq!(machine.handle_line("$140"), vec!["$140=2000", "ok"]);
        assert!(machine.handle_line("$$").contains(&"$140=2000".to_string()));
        assert_eq!(machine.handle_line("$999"), vec!["error:3"]);
        assert!(machine.handle_line("$I")[0].starts_with("[VER:"));
    }

    #[test]
    fn test_alarm_locks_gcode() {
        let mut machine = SimulatedMachine::default();
        machine.trigger_alarm(1);
        assert_eq!(machine.handle_line("G0 X1"), vec!["error:9"]);
        assert_eq!(machine.handle_line("$X").last().map(String::as_str), Some("ok"));
        assert_eq!(machine.status(), MachineStatus::Idle);
    }

    #[test]
    fn test_realtime() {
        let mut machine = SimulatedMachine::default();
        assert!(machine.handle_realtime(RealtimeCommand::StatusReport)[0].starts_with("<Idle|MPos:"));
        machine.handle_realtime(RealtimeCommand::FeedHold);
        assert_eq!(machine.status(), MachineStatus::Hold);
        machine.handle_realtime(RealtimeCommand::CycleStart);
        assert_eq!(machine.status(), MachineStatus::Idle);
        assert_eq!(
            machine.handle_realtime(RealtimeCommand::SoftReset),
            vec![SIMULATED_BANNER.to_string()]
        );
    }
}
