use fluidcnc_communication::firmware::grbl::response_parser::*;
use fluidcnc_core::{MachineStatus, Position};

fn parse(line: &str) -> GrblResponse {
    GrblResponseParser::new()
        .parse(line)
        .expect("parse")
        .expect("non-blank")
}

#[test]
fn test_parse_ok() {
    assert_eq!(parse("ok"), GrblResponse::Ok);
    assert_eq!(parse("ok\r"), GrblResponse::Ok);
}

#[test]
fn test_parse_error() {
    assert_eq!(parse("error:1"), GrblResponse::Error(1));
    assert_eq!(parse("error:23"), GrblResponse::Error(23));
}

#[test]
fn test_parse_alarm() {
    assert_eq!(parse("ALARM:1"), GrblResponse::Alarm(1));
    assert_eq!(parse("alarm:6"), GrblResponse::Alarm(6));
}

#[test]
fn test_parse_status_report() {
    match parse("<Idle|MPos:1.000,2.000,3.000|FS:0,0>") {
        GrblResponse::Status(status) => {
            assert_eq!(status.status, MachineStatus::Idle);
            assert_eq!(status.machine_position, Some(Position::new(1.0, 2.0, 3.0)));
        }
        other => panic!("expected status, got {:?}", other),
    }
}

#[test]
fn test_parse_probe() {
    match parse("[PRB:1.500,-2.000,-10.250:1]") {
        GrblResponse::Probe(probe) => {
            assert!(probe.success);
            assert_eq!(probe.position, Position::new(1.5, -2.0, -10.25));
        }
        other => panic!("expected probe, got {:?}", other),
    }
}

#[test]
fn test_parse_setting() {
    assert_eq!(
        parse("$130=300.000"),
        GrblResponse::Setting {
            number: 130,
            value: "300.000".to_string()
        }
    );
}

#[test]
fn test_parse_parser_state() {
    match parse("[GC:G0 G55 G17 G21 G90 G94 M5 M9 T2 F0 S0]") {
        GrblResponse::ParserState(state) => {
            assert_eq!(state.wcs.as_deref(), Some("G55"));
            assert_eq!(state.tool, Some(2));
        }
        other => panic!("expected parser state, got {:?}", other),
    }
}

#[test]
fn test_parse_welcome_and_feedback() {
    assert!(matches!(
        parse("GrblHAL 1.1f ['$' or '$HELP' for help]"),
        GrblResponse::Welcome(_)
    ));
    assert_eq!(
        parse("[MSG:Caution: Unlocked]"),
        GrblResponse::Feedback("Caution: Unlocked".to_string())
    );
}

#[test]
fn test_parse_auxiliary_json() {
    assert!(matches!(
        parse(r#"{"type":"vfd_status","rpm":12000}"#),
        GrblResponse::Auxiliary(_)
    ));
}

#[test]
fn test_malformed_lines() {
    let parser = GrblResponseParser::new();
    assert!(parser.parse("error:abc").is_err());
    assert!(parser.parse("<Idle|MPos:0,0,0").is_err());
    assert!(parser.parse("[PRB:1,2,3:x]").is_err());
    assert_eq!(parser.parse("   ").expect("blank"), None);
}

#[test]
fn test_line_noise_with_replacement_chars() {
    let parser = GrblResponseParser::new();
    let noise = String::from_utf8_lossy(b"abcd\xff\xff");
    assert_eq!(
        parser.parse(&noise).expect("noise"),
        Some(GrblResponse::Message(noise.to_string()))
    );
    assert_eq!(
        parser.parse("alarm:9").expect("lowercase alarm"),
        Some(GrblResponse::Alarm(9))
    );
    assert!(parser.parse("ALARM:\u{fffd}").is_err());
}

#[test]
fn test_parse_build_info() {
    assert_eq!(
        parse("[VER:1.1f.20240131:]"),
        GrblResponse::Version("1.1f.20240131".to_string())
    );
    assert_eq!(
        parse("[OPT:VNMSL,35,1024]"),
        GrblResponse::BuildOptions("VNMSL,35,1024".to_string())
    );
}
