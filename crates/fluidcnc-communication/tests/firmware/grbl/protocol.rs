use fluidcnc_communication::communication::{LinkWriter, SendOptions};
use fluidcnc_communication::firmware::grbl::protocol::*;
use fluidcnc_communication::safety::{CommandFixer, FixerVerdict};
use fluidcnc_communication::RealtimeCommand;
use fluidcnc_core::{
    CncEvent, ConnectionError, Error, MachineEvent, SafetyEvent, StreamError, ValidationError,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Wire {
    lines: Mutex<Vec<String>>,
}

impl LinkWriter for Wire {
    fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn write_realtime(&self, _command: RealtimeCommand) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }

    fn name(&self) -> String {
        "wire".to_string()
    }
}

/// Forces metric mode ahead of every move and refuses tool changes
struct MetricOnly;

impl CommandFixer for MetricOnly {
    fn check(&self, command: &str) -> FixerVerdict {
        if command.contains("M6") {
            return FixerVerdict::block("tool changes are manual");
        }
        if command.starts_with("G0") || command.starts_with("G1") {
            return FixerVerdict::pass().with_prefix(vec!["G21".to_string()]);
        }
        FixerVerdict::pass()
    }
}

fn connected() -> (ProtocolCore, Arc<Wire>) {
    let mut core = ProtocolCore::default();
    let wire = Arc::new(Wire::default());
    core.attach(wire.clone());
    (core, wire)
}

#[test]
fn test_fixer_prefix_and_block() {
    let (mut core, wire) = connected();
    core.set_fixer(Some(Arc::new(MetricOnly)));

    core.submit("G0 X1", SendOptions::default(), None, false)
        .expect("sent");
    assert_eq!(*wire.lines.lock(), vec!["G21", "G0 X1"]);
    assert_eq!(core.outstanding(), 2);

    let err = core
        .submit("M6 T2", SendOptions::default(), None, false)
        .expect_err("blocked");
    assert!(matches!(
        err,
        Error::Validation(ValidationError::Blocked { .. })
    ));
    assert!(core.take_events().iter().any(|e| matches!(
        e,
        CncEvent::Safety(SafetyEvent::CommandBlocked { .. })
    )));
    assert_eq!(wire.lines.lock().len(), 2);
}

#[test]
fn test_stream_rejects_invalid_line_before_sending() {
    let (mut core, wire) = connected();
    let err = core
        .start_stream(
            vec!["G0 X1".to_string(), "G1 X2 F0".to_string()],
            false,
        )
        .expect_err("invalid");
    assert!(matches!(
        err,
        Error::Stream(StreamError::InvalidLine { index: 1, .. })
    ));
    assert!(wire.lines.lock().is_empty());
    assert!(!core.is_streaming());
}

#[test]
fn test_chunked_input_and_parser_state() {
    let (mut core, _wire) = connected();
    core.handle_inbound_text("[GC:G0 G56 G17 G21 G90 ");
    assert_eq!(core.state().active_wcs, "G54");
    core.handle_inbound_text("G94 M5 M9 T4 F0 S0]\r\n");
    assert_eq!(core.state().active_wcs, "G56");
    assert_eq!(core.state().tool, 4);
}

#[test]
fn test_auxiliary_payload_passed_through() {
    let (mut core, _wire) = connected();
    core.handle_auxiliary(serde_json::json!({ "type": "vfd_status", "rpm": 12000 }));
    core.handle_inbound_text("{\"type\":\"bridge_status\",\"clients\":2}\n");
    let aux = core
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, CncEvent::Machine(MachineEvent::Auxiliary { .. })))
        .count();
    assert_eq!(aux, 2);
    assert_eq!(core.state().status, fluidcnc_core::MachineStatus::Unknown);
}

#[test]
fn test_unparseable_line_is_dropped() {
    let (mut core, _wire) = connected();
    core.submit("G0 X1", SendOptions::default(), None, false)
        .expect("sent");
    core.handle_inbound_text("error:xyz\n");
    assert_eq!(core.outstanding(), 1);
    core.handle_inbound_text("ok\n");
    assert_eq!(core.outstanding(), 0);
}

#[test]
fn test_lossy_decoded_noise_is_tolerated() {
    let (mut core, _wire) = connected();
    core.submit("G0 X1", SendOptions::default(), None, false)
        .expect("sent");
    core.handle_inbound_text(&String::from_utf8_lossy(b"abcd\xff\xff\n"));
    core.handle_inbound_text(&String::from_utf8_lossy(b"\xffALARM:\xfe\n"));
    assert_eq!(core.outstanding(), 1);
    core.handle_inbound_text("ok\n");
    assert_eq!(core.outstanding(), 0);
}
