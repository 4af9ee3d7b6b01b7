//! Tests for firmware::reconnect

use fluidcnc_communication::firmware::reconnect::ReconnectPolicy;
use std::time::Duration;

#[test]
fn test_delays_grow_to_cap() {
    let mut policy = ReconnectPolicy::new(
        Duration::from_millis(1000),
        1.5,
        Duration::from_millis(30_000),
        20,
    );
    let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
        .map(|(_, d)| d.as_millis() as u64)
        .collect();
    assert_eq!(delays.len(), 20);
    assert_eq!(&delays[..4], &[1000, 1500, 2250, 3375]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*delays.last().expect("delays"), 30_000);
}

#[test]
fn test_exhaustion_and_reset() {
    let mut policy = ReconnectPolicy::new(
        Duration::from_millis(10),
        2.0,
        Duration::from_millis(100),
        2,
    );
    assert_eq!(policy.next_delay(), Some((1, Duration::from_millis(10))));
    assert_eq!(policy.next_delay(), Some((2, Duration::from_millis(20))));
    assert_eq!(policy.next_delay(), None);
    assert!(policy.is_exhausted());

    policy.reset();
    assert_eq!(policy.attempts(), 0);
    assert_eq!(policy.next_delay(), Some((1, Duration::from_millis(10))));
}
