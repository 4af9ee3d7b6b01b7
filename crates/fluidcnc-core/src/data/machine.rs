use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{Axis, Position};

/// Machine status as reported in the first field of a status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineStatus {
    /// No report received yet, or a state this client does not know
    #[default]
    Unknown,
    /// Idle, ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold
    Hold,
    /// Jogging
    Jog,
    /// Homing cycle
    Home,
    /// Alarm lock (requires unlock or homing)
    Alarm,
    /// Safety door open
    Door,
    /// Sleep mode
    Sleep,
    /// G-code check mode
    Check,
    /// Tool change pending (grblHAL)
    Tool,
}

impl MachineStatus {
    /// Parse the state field of a status report; sub-state suffixes such as
    /// `Hold:0` or `Door:1` are stripped.
    pub fn from_report(field: &str) -> Self {
        let name = field.split(':').next().unwrap_or_default();
        match name {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Hold" => Self::Hold,
            "Jog" => Self::Jog,
            "Home" => Self::Home,
            "Alarm" => Self::Alarm,
            "Door" => Self::Door,
            "Sleep" => Self::Sleep,
            "Check" => Self::Check,
            "Tool" => Self::Tool,
            _ => Self::Unknown,
        }
    }

    /// States in which an active stream must be aborted
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Alarm | Self::Door)
    }

    /// States from which the emergency-stop lockout may be cleared
    pub fn is_safe_resting(&self) -> bool {
        matches!(self, Self::Idle | Self::Alarm | Self::Sleep)
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(self, Self::Run | Self::Jog | Self::Home)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Home => "Home",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Sleep => "Sleep",
            Self::Check => "Check",
            Self::Tool => "Tool",
        };
        write!(f, "{}", name)
    }
}

/// Spindle direction from the accessory field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpindleDirection {
    /// Spindle stopped
    #[default]
    Off,
    /// Clockwise (M3)
    Clockwise,
    /// Counter-clockwise (M4)
    CounterClockwise,
}

/// Coolant outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoolantState {
    /// Flood coolant (M8)
    pub flood: bool,
    /// Mist coolant (M7)
    pub mist: bool,
}

/// Override percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    /// Feed override percent
    pub feed: u16,
    /// Rapid override percent
    pub rapid: u16,
    /// Spindle override percent
    pub spindle: u16,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Firmware buffer occupancy from `Bf:`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferState {
    /// Free planner blocks
    pub planner_slots: u16,
    /// Free receive-buffer bytes
    pub rx_bytes: u16,
}

/// Result of a `G38.x` probe cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Machine position where the probe stopped
    pub position: Position,
    /// Whether the probe made contact
    pub success: bool,
}

/// Per-axis maximum travel from `$130`-`$132`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TravelLimits {
    /// `$130`
    pub x: Option<f64>,
    /// `$131`
    pub y: Option<f64>,
    /// `$132`
    pub z: Option<f64>,
}

impl TravelLimits {
    /// Maximum travel for an axis, if known
    pub fn get(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Record the travel for an axis
    pub fn set(&mut self, axis: Axis, travel: f64) {
        match axis {
            Axis::X => self.x = Some(travel),
            Axis::Y => self.y = Some(travel),
            Axis::Z => self.z = Some(travel),
        }
    }

    /// Machine-coordinate envelope for an axis, assuming homing to the
    /// positive end (`[-travel, 0]`)
    pub fn envelope(&self, axis: Axis) -> Option<(f64, f64)> {
        self.get(axis)
            .filter(|t| *t > 0.0)
            .map(|travel| (-travel, 0.0))
    }
}

/// Authoritative model of the machine, maintained from status reports
///
/// `work_position` is always `machine_position - work_offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    /// Machine status
    pub status: MachineStatus,
    /// Sub-state code (`Hold:1`, `Door:2`, ...)
    pub substate: Option<u8>,
    /// Machine position
    pub machine_position: Position,
    /// Work position
    pub work_position: Position,
    /// Work coordinate offset
    pub work_offset: Position,
    /// Current feed rate
    pub feed_rate: f64,
    /// Current spindle speed
    pub spindle_speed: f64,
    /// Spindle direction
    pub spindle: SpindleDirection,
    /// Coolant outputs
    pub coolant: CoolantState,
    /// Active tool number
    pub tool: u32,
    /// Override percentages
    pub overrides: Overrides,
    /// Firmware buffer occupancy
    pub buffer: BufferState,
    /// Line number being executed
    pub line_number: Option<u32>,
    /// Raw pin-state flags (empty when no pin is triggered)
    pub pins: String,
    /// Stepper load telemetry (`SG:` field)
    pub stepper_load: Option<Position>,
    /// Active work coordinate system (`G54`...)
    pub active_wcs: String,
    /// Max travel settings
    pub travel: TravelLimits,
    /// Raw `$N=value` setting echoes
    pub settings: BTreeMap<u16, String>,
    /// Last welcome banner
    pub banner: Option<String>,
    /// `[VER:]` from `$I`
    pub firmware_version: Option<String>,
    /// `[OPT:]` from `$I`
    pub build_options: Option<String>,
    /// Most recent probe result
    pub last_probe: Option<ProbeResult>,
    /// True until a live status report replaces a restored snapshot
    pub restored: bool,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            status: MachineStatus::Unknown,
            substate: None,
            machine_position: Position::default(),
            work_position: Position::default(),
            work_offset: Position::default(),
            feed_rate: 0.0,
            spindle_speed: 0.0,
            spindle: SpindleDirection::Off,
            coolant: CoolantState::default(),
            tool: 0,
            overrides: Overrides::default(),
            buffer: BufferState::default(),
            line_number: None,
            pins: String::new(),
            stepper_load: None,
            active_wcs: "G54".to_string(),
            travel: TravelLimits::default(),
            settings: BTreeMap::new(),
            banner: None,
            firmware_version: None,
            build_options: None,
            last_probe: None,
            restored: false,
        }
    }
}

impl MachineState {
    /// Create a fresh state with unknown status
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the machine position and derive the work position
    pub fn set_machine_position(&mut self, mpos: Position) {
        self.machine_position = mpos;
        self.work_position = mpos - self.work_offset;
    }

    /// Set the work position and derive the machine position
    pub fn set_work_position(&mut self, wpos: Position) {
        self.work_position = wpos;
        self.machine_position = wpos + self.work_offset;
    }

    /// Replace the work offset, keeping the machine position fixed
    pub fn set_work_offset(&mut self, wco: Position) {
        self.work_offset = wco;
        self.work_position = self.machine_position - wco;
    }

    /// Whether `work_position == machine_position - work_offset` holds
    pub fn positions_consistent(&self) -> bool {
        (self.machine_position - self.work_offset).max_deviation(&self.work_position) < 1e-9
    }
}
