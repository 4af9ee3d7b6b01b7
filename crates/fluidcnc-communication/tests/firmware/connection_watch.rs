//! Tests for firmware::connection_watch

use fluidcnc_communication::firmware::connection_watch::*;
use fluidcnc_settings::SupervisorSettings;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_activity_clock_touch() {
    let clock = ActivityClock::new();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(clock.elapsed() >= Duration::from_millis(300));

    clock.touch();
    assert_eq!(clock.elapsed(), Duration::ZERO);
}

#[test]
fn test_config_from_settings() {
    let settings = SupervisorSettings {
        heartbeat_interval_ms: 500,
        heartbeat_timeout_ms: 1500,
        ..Default::default()
    };
    let config = ConnectionWatchConfig::from_settings(&settings);
    assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
    assert_eq!(config.heartbeat(Duration::from_millis(1499)), HeartbeatAction::SendProbe);
    assert_eq!(config.heartbeat(Duration::from_millis(1500)), HeartbeatAction::ForceClose);
}

#[test]
fn test_state_classification() {
    let config = ConnectionWatchConfig::default();
    assert_eq!(
        config.state(Duration::from_secs(1), true),
        ConnectionWatchState::Healthy
    );
    assert_eq!(
        config.state(Duration::from_secs(6), true),
        ConnectionWatchState::Lost
    );
    assert_eq!(
        config.state(Duration::from_secs(6), false),
        ConnectionWatchState::Healthy
    );
    assert_eq!(
        config.state(Duration::from_secs(11), false),
        ConnectionWatchState::Stale
    );
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_reprobes_after_new_data() {
    let clock = ActivityClock::new();
    let mut watchdog = Watchdog::new(ConnectionWatchConfig::default());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(watchdog.check(&clock, false), WatchdogAction::Probe);
    assert_eq!(watchdog.check(&clock, false), WatchdogAction::None);

    clock.touch();
    assert_eq!(watchdog.check(&clock, false), WatchdogAction::None);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(watchdog.check(&clock, false), WatchdogAction::Probe);
}
