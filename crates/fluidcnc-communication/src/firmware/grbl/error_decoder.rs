//! grbl/grblHAL error and alarm code decoder
//!
//! Converts numeric `error:N` and `ALARM:N` codes to human-readable text and
//! attaches a recovery hint to every alarm.

const ERRORS: &[(u32, &str)] = &[
    (1, "Expected command letter"),
    (2, "Bad number format"),
    (3, "Invalid '$' statement"),
    (4, "Negative value"),
    (5, "Homing not enabled"),
    (6, "Step pulse under 3us"),
    (7, "EEPROM read failed, defaults restored"),
    (8, "'$' command requires Idle"),
    (9, "G-code locked out during alarm or jog"),
    (10, "Soft limits require homing"),
    (11, "Line too long"),
    (12, "Step rate too high"),
    (13, "Safety door open"),
    (14, "Startup line too long"),
    (15, "Jog target exceeds travel"),
    (16, "Invalid jog command"),
    (17, "Laser mode requires PWM output"),
    (18, "Reset asserted"),
    (19, "Non-positive value"),
    (20, "Unsupported G-code"),
    (21, "Modal group violation"),
    (22, "Feed rate undefined"),
    (23, "Integer value required"),
    (24, "Two commands need axis words"),
    (25, "Repeated G-code word"),
    (26, "No axis words"),
    (27, "Line number out of range"),
    (28, "Missing P or L value"),
    (29, "Unsupported work coordinate system"),
    (30, "G53 requires G0 or G1"),
    (31, "Unused axis words with G80"),
    (32, "Arc has no axis words in plane"),
    (33, "Invalid motion target"),
    (34, "Arc radius error"),
    (35, "Arc missing offset word"),
    (36, "Unused G-code words"),
    (37, "Tool length offset axis mismatch"),
    (38, "Tool number out of range"),
    (39, "Canned cycle not active"),
    (40, "Value word missing"),
    (41, "Value word conflict"),
    (42, "Invalid canned cycle retract"),
    (43, "Spindle speed required"),
    (44, "PID log full"),
    (45, "Max step rate exceeded"),
    (46, "Safety door already open"),
    (47, "Jog or G28/G30 not allowed in program"),
    (48, "Unsupported P parameter"),
    (49, "Value out of range"),
    (50, "Step pulse minimum exceeds pulse time"),
    (51, "Limit check failed during homing"),
    (52, "Limit switch pull-off failed"),
    (53, "Invalid file number"),
    (54, "File is read-only"),
    (55, "File is empty"),
    (56, "File not found"),
    (57, "File read failed"),
    (58, "Spindle at-speed timeout"),
    (59, "Spindle not running"),
    (60, "Invalid value for context"),
    (61, "Configuration failed"),
    (62, "Illegal homing state"),
    (63, "Max travel exceeded"),
    (64, "Max feed rate exceeded"),
    (65, "Feature disabled"),
    (66, "Password required"),
    (67, "Invalid password"),
    (68, "Bluetooth initialisation failed"),
    (69, "Homing required"),
    (70, "Invalid plane selected"),
    (71, "Tool change required"),
    (72, "Not allowed in current state"),
    (73, "Self-test failed"),
    (74, "Controller busy"),
    (75, "Single axis required"),
];

const ALARMS: &[(u32, &str, &str)] = &[
    (1, "Hard limit triggered", "Position is lost. Unlock with $X, then re-home with $H"),
    (2, "Soft limit: target exceeds travel", "Unlock with $X and jog back inside travel"),
    (3, "Reset while in motion", "Position may be lost. Re-home with $H"),
    (4, "Probe fail: probe not in expected initial state", "Check probe wiring, then unlock with $X"),
    (5, "Probe fail: no contact within travel", "Move closer or extend probe distance, then unlock with $X"),
    (6, "Homing fail: reset during cycle", "Re-run homing with $H"),
    (7, "Homing fail: safety door opened", "Close the door and re-run homing with $H"),
    (8, "Homing fail: pull-off did not clear switch", "Increase pull-off or check switch wiring, then $H"),
    (9, "Homing fail: switch not found", "Check limit switches and max travel, then $H"),
    (10, "Limit switch engaged at start", "Clear the switch manually, then $H"),
    (11, "Homing required", "Home the machine with $H"),
    (12, "E-stop asserted", "Release the E-stop, soft-reset, then unlock with $X"),
    (13, "Motor fault", "Check stepper drivers and power, then soft-reset"),
    (14, "Homing configuration error", "Review homing settings ($22-$27)"),
    (15, "Self-test failed", "Power-cycle the controller"),
    (16, "Spindle at-speed timeout", "Check the spindle/VFD, then unlock with $X"),
    (17, "Probe protection triggered", "Check the probe circuit, then unlock with $X"),
    (18, "Spindle sync lost", "Check the spindle encoder, then unlock with $X"),
    (19, "Power supply fault", "Check input power, then soft-reset"),
    (20, "Controller error", "Power-cycle the controller"),
];

/// Decode an `error:N` code
pub fn decode_error(code: u32) -> String {
    ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| (*text).to_string())
        .unwrap_or_else(|| format!("Unknown error code: {}", code))
}

/// Decode an `ALARM:N` code
pub fn decode_alarm(code: u32) -> String {
    ALARMS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, text, _)| (*text).to_string())
        .unwrap_or_else(|| format!("Unknown alarm code: {}", code))
}

/// Recovery hint for an alarm
pub fn alarm_recovery_hint(code: u32) -> String {
    ALARMS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, _, hint)| (*hint).to_string())
        .unwrap_or_else(|| "Soft-reset the controller and unlock with $X".to_string())
}

/// Format error message with code and description
pub fn format_error(code: u32) -> String {
    format!("error:{} - {}", code, decode_error(code))
}

/// Format alarm message with code and description
pub fn format_alarm(code: u32) -> String {
    format!("ALARM:{} - {}", code, decode_alarm(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error() {
        assert_eq!(decode_error(1), "Expected command letter");
        assert_eq!(decode_error(9), "G-code locked out during alarm or jog");
        assert_eq!(decode_error(26), "No axis words");
        assert_eq!(decode_error(69), "Homing required");
        assert!(decode_error(255).contains("Unknown error code"));
    }

    #[test]
    fn test_decode_alarm() {
        assert!(decode_alarm(1).contains("Hard limit"));
        assert!(decode_alarm(2).contains("Soft limit"));
        assert!(decode_alarm(12).contains("E-stop"));
        assert!(decode_alarm(255).contains("Unknown alarm code"));
    }

    #[test]
    fn test_alarm_hints() {
        assert!(alarm_recovery_hint(1).contains("$H"));
        assert!(alarm_recovery_hint(4).contains("probe"));
        assert!(alarm_recovery_hint(99).contains("$X"));
    }

    #[test]
    fn test_format() {
        assert!(format_error(1).starts_with("error:1"));
        assert!(format_alarm(1).starts_with("ALARM:1"));
    }
}
