use fluidcnc_communication::firmware::grbl::status_parser::*;
use fluidcnc_core::{MachineState, MachineStatus, Position, SpindleDirection};

#[test]
fn test_full_report() {
    let report = parse_status_report(
        "Run|MPos:10.000,5.000,-2.500|Bf:15,128|FS:1500,12000|WCO:1.000,1.000,0.000|Ov:110,100,90|A:SF|Pn:XP|Ln:42|T:3",
    );
    assert_eq!(report.status, MachineStatus::Run);
    assert_eq!(report.machine_position, Some(Position::new(10.0, 5.0, -2.5)));
    assert_eq!(report.feed_rate, Some(1500.0));
    assert_eq!(report.spindle_speed, Some(12000.0));
    assert_eq!(report.line_number, Some(42));
    assert_eq!(report.tool, Some(3));
    assert_eq!(report.pins.as_deref(), Some("XP"));
    let acc = report.accessories.expect("accessories");
    assert_eq!(acc.spindle, SpindleDirection::Clockwise);
    assert!(acc.flood);
}

#[test]
fn test_substate_and_garbage_numbers() {
    let report = parse_status_report("Hold:1|MPos:abc,NaN,inf");
    assert_eq!(report.status, MachineStatus::Hold);
    assert_eq!(report.substate, Some(1));
    assert_eq!(report.machine_position, Some(Position::new(0.0, 0.0, 0.0)));
}

#[test]
fn test_apply_keeps_positions_consistent() {
    let mut state = MachineState::new();
    apply_status(
        &mut state,
        &parse_status_report("Idle|WPos:5.000,5.000,5.000|WCO:10.000,0.000,-1.000"),
    );
    assert_eq!(state.machine_position, Position::new(15.0, 5.0, 4.0));
    assert!(state.positions_consistent());

    apply_status(&mut state, &parse_status_report("Idle|MPos:0.000,0.000,0.000"));
    assert_eq!(state.work_position, Position::new(-10.0, 0.0, 1.0));
    assert!(state.positions_consistent());
}

#[test]
fn test_overrides_without_accessories_clear_outputs() {
    let mut state = MachineState::new();
    apply_status(&mut state, &parse_status_report("Run|MPos:0,0,0|Ov:100,100,100|A:SFM"));
    assert!(state.coolant.mist);
    apply_status(&mut state, &parse_status_report("Run|MPos:0,0,0|Ov:100,100,100"));
    assert!(!state.coolant.mist);
    assert!(!state.coolant.flood);
    assert_eq!(state.spindle, SpindleDirection::Off);
}
