use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use gpiohal::backend::{MockBias, MockDirection, MockEdge};
use gpiohal::{
    DetectionState, Direction, Edge, EdgeCallback, EdgeEvent, GpioError, GpioInterface, MockDriver,
    PullMode,
};

fn interface() -> (Arc<MockDriver>, Arc<GpioInterface<MockDriver>>) {
    let driver = Arc::new(MockDriver::default());
    let gpio = GpioInterface::new(driver.clone(), 16).expect("interface");
    (driver, Arc::new(gpio))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn channel_callback() -> (EdgeCallback, mpsc::Receiver<EdgeEvent>) {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let callback: EdgeCallback = Arc::new(move |event: &EdgeEvent| {
        let _ = tx.lock().unwrap().send(event.clone());
    });
    (callback, rx)
}

fn accepted(gpio: &GpioInterface<MockDriver>, pin: u32) -> u64 {
    gpio.pin_status(pin).expect("configured pin").accepted
}

#[test]
fn io_follows_configured_direction() {
    let (_driver, gpio) = interface();

    for pull in [PullMode::Off, PullMode::Down, PullMode::Up] {
        gpio.setup(1, Direction::In, pull).unwrap();
        assert!(gpio.input(1).is_ok());
        assert!(matches!(gpio.output(1, true), Err(GpioError::InvalidState(_))));

        gpio.setup(2, Direction::Out, pull).unwrap();
        assert!(gpio.output(2, true).is_ok());
        assert!(matches!(gpio.input(2), Err(GpioError::InvalidState(_))));
    }
}

#[test]
fn neutral_modes_reach_driver_translated() {
    let (driver, gpio) = interface();

    gpio.setup(5, Direction::In, PullMode::Up).unwrap();
    assert_eq!(
        driver.configured(5),
        Some((MockDirection::Input, MockBias::PullUp))
    );
    assert!(gpio.input(5).unwrap());

    gpio.setup(5, Direction::In, PullMode::Down).unwrap();
    assert_eq!(
        driver.configured(5),
        Some((MockDirection::Input, MockBias::PullDown))
    );
    assert!(!gpio.input(5).unwrap());

    gpio.add_event_detect(5, Edge::Both, None, None).unwrap();
    assert_eq!(driver.armed_edge(5), Some(MockEdge::Both));

    // pull resistors only apply to inputs
    gpio.setup(6, Direction::Out, PullMode::Up).unwrap();
    assert_eq!(
        driver.configured(6),
        Some((MockDirection::Output, MockBias::Floating))
    );
}

#[test]
fn unconfigured_pin_rejects_every_operation() {
    let (_driver, gpio) = interface();
    let (callback, _rx) = channel_callback();

    assert!(matches!(gpio.input(11), Err(GpioError::InvalidState(_))));
    assert!(matches!(gpio.output(11, true), Err(GpioError::InvalidState(_))));
    assert!(matches!(
        gpio.add_event_detect(11, Edge::Rising, None, None),
        Err(GpioError::InvalidState(_))
    ));
    assert!(matches!(
        gpio.add_event_callback(11, callback, None),
        Err(GpioError::InvalidState(_))
    ));
    assert!(matches!(gpio.event_detected(11), Err(GpioError::InvalidState(_))));
    assert!(matches!(
        gpio.wait_for_edge(11, Edge::Rising),
        Err(GpioError::InvalidState(_))
    ));

    assert!(gpio.remove_event_detect(11).is_ok());
    assert_eq!(gpio.detection_state(11), DetectionState::Unarmed);
    assert!(gpio.pin_status(11).is_none());
}

#[test]
fn repeated_setup_is_idempotent() {
    let (driver, gpio) = interface();

    gpio.setup(4, Direction::In, PullMode::Up).unwrap();
    gpio.add_event_detect(4, Edge::Falling, None, Some(20)).unwrap();
    let once = gpio.pin_status(4).unwrap();

    gpio.setup(4, Direction::In, PullMode::Up).unwrap();
    let twice = gpio.pin_status(4).unwrap();

    assert_eq!(once.direction, twice.direction);
    assert_eq!(once.pull, twice.pull);
    assert_eq!(once.detection, twice.detection);
    assert_eq!(once.edge, twice.edge);
    assert_eq!(once.debounce_ms, twice.debounce_ms);
    assert_eq!(driver.armed_edge(4), Some(MockEdge::Falling));
    assert!(gpio.input(4).unwrap());
}

#[test]
fn edges_inside_debounce_window_are_suppressed() {
    let (driver, gpio) = interface();
    gpio.setup(1, Direction::In, PullMode::Off).unwrap();
    gpio.setup(2, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(1, Edge::Rising, None, Some(50)).unwrap();
    gpio.add_event_detect(2, Edge::Rising, None, Some(50)).unwrap();

    driver.inject_edge(1, Edge::Rising, 1_000).unwrap();
    driver.inject_edge(1, Edge::Rising, 1_049).unwrap();
    assert_eq!(accepted(&gpio, 1), 1);

    driver.inject_edge(2, Edge::Rising, 1_000).unwrap();
    driver.inject_edge(2, Edge::Rising, 1_050).unwrap();
    assert_eq!(accepted(&gpio, 2), 2);
}

#[test]
fn debounce_measures_from_last_accepted_edge() {
    let (driver, gpio) = interface();
    gpio.setup(7, Direction::In, PullMode::Up).unwrap();
    gpio.add_event_detect(7, Edge::Rising, None, Some(50)).unwrap();

    driver.inject_edge(7, Edge::Rising, 0).unwrap();
    driver.inject_edge(7, Edge::Rising, 20).unwrap();
    assert_eq!(accepted(&gpio, 7), 1);

    // 60ms after the suppressed edge, 80ms after the accepted one
    driver.inject_edge(7, Edge::Rising, 80).unwrap();
    assert_eq!(accepted(&gpio, 7), 2);

    driver.inject_edge(7, Edge::Rising, 110).unwrap();
    assert_eq!(accepted(&gpio, 7), 2);
}

#[test]
fn zero_debounce_dispatches_every_edge() {
    let (driver, gpio) = interface();
    gpio.setup(1, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(1, Edge::Both, None, Some(0)).unwrap();

    for (i, edge) in [Edge::Rising, Edge::Falling, Edge::Rising].into_iter().enumerate() {
        driver.inject_edge(1, edge, i as u64).unwrap();
    }

    assert_eq!(accepted(&gpio, 1), 3);
    assert_eq!(gpio.pin_status(1).unwrap().debounce_ms, None);
}

#[test]
fn registration_edge_filters_observed_edges() {
    let (driver, gpio) = interface();
    gpio.setup(1, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(1, Edge::Rising, None, None).unwrap();

    driver.inject_edge(1, Edge::Falling, 0).unwrap();
    assert!(!gpio.event_detected(1).unwrap());

    driver.inject_edge(1, Edge::Rising, 10).unwrap();
    assert!(gpio.event_detected(1).unwrap());
}

#[test]
fn event_detected_reports_once_per_accepted_edge() {
    let (driver, gpio) = interface();
    gpio.setup(3, Direction::In, PullMode::Down).unwrap();
    gpio.add_event_detect(3, Edge::Rising, None, None).unwrap();

    assert!(!gpio.event_detected(3).unwrap());
    driver.drive(3, true).unwrap();
    assert!(gpio.event_detected(3).unwrap());
    assert!(!gpio.event_detected(3).unwrap());
}

#[test]
fn removed_detection_cannot_be_polled() {
    let (driver, gpio) = interface();
    gpio.setup(3, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(3, Edge::Both, None, None).unwrap();
    assert_eq!(gpio.detection_state(3), DetectionState::Armed);

    gpio.remove_event_detect(3).unwrap();
    assert_eq!(gpio.detection_state(3), DetectionState::Unarmed);
    assert_eq!(driver.armed_edge(3), None);
    assert!(matches!(gpio.event_detected(3), Err(GpioError::InvalidState(_))));

    assert!(gpio.remove_event_detect(3).is_ok());
}

#[test]
fn output_pin_cannot_be_read() {
    let (driver, gpio) = interface();

    gpio.setup(3, Direction::Out, PullMode::Off).unwrap();
    gpio.output(3, true).unwrap();
    assert_eq!(driver.level(3), Some(true));

    assert!(matches!(gpio.input(3), Err(GpioError::InvalidState(_))));
}

#[test]
fn output_pin_cannot_detect_edges() {
    let (_driver, gpio) = interface();
    gpio.setup(3, Direction::Out, PullMode::Off).unwrap();

    assert!(matches!(
        gpio.add_event_detect(3, Edge::Rising, None, None),
        Err(GpioError::InvalidState(_))
    ));
    assert!(matches!(
        gpio.wait_for_edge_timeout(3, Edge::Rising, Some(Duration::from_millis(10))),
        Err(GpioError::InvalidState(_))
    ));
}

#[test]
fn reconfiguring_as_output_drops_detection() {
    let (driver, gpio) = interface();
    gpio.setup(8, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(8, Edge::Rising, None, None).unwrap();

    gpio.setup(8, Direction::Out, PullMode::Off).unwrap();

    assert_eq!(gpio.detection_state(8), DetectionState::Unarmed);
    assert_eq!(driver.armed_edge(8), None);
    assert!(matches!(gpio.event_detected(8), Err(GpioError::InvalidState(_))));
}

#[test]
fn reconfiguring_as_output_cancels_blocked_wait() {
    let (driver, gpio) = interface();
    gpio.setup(14, Direction::In, PullMode::Off).unwrap();

    let waiter = {
        let gpio = gpio.clone();
        thread::spawn(move || gpio.wait_for_edge(14, Edge::Rising))
    };
    wait_until(|| driver.armed_edge(14) == Some(MockEdge::Rising));

    gpio.setup(14, Direction::Out, PullMode::Off).unwrap();

    assert!(matches!(waiter.join().unwrap(), Err(GpioError::Cancelled(_))));
    assert_eq!(driver.armed_edge(14), None);
    assert_eq!(gpio.pin_status(14).unwrap().waiters, 0);
}

#[test]
fn failed_reconfigure_keeps_detection_armed() {
    let (driver, gpio) = interface();
    gpio.setup(7, Direction::In, PullMode::Up).unwrap();
    gpio.add_event_detect(7, Edge::Rising, None, None).unwrap();

    driver.fail_configure(7, "bias not supported");
    assert!(matches!(
        gpio.setup(7, Direction::In, PullMode::Down),
        Err(GpioError::Driver(_))
    ));

    assert_eq!(gpio.detection_state(7), DetectionState::Armed);
    assert_eq!(driver.armed_edge(7), Some(MockEdge::Rising));
    assert_eq!(gpio.pin_status(7).unwrap().pull, PullMode::Up);

    driver.inject_edge(7, Edge::Rising, 10).unwrap();
    assert!(gpio.event_detected(7).unwrap());
}

#[test]
fn lagging_callbacks_drop_oldest_events() {
    let driver = Arc::new(MockDriver::default());
    let gpio = GpioInterface::new(driver.clone(), 1).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let started_tx = std::sync::Mutex::new(started_tx);
    let release_rx = std::sync::Mutex::new(release_rx);
    let blocking: EdgeCallback = Arc::new(move |event: &EdgeEvent| {
        let _ = started_tx.lock().unwrap().send(event.timestamp_ms);
        let _ = release_rx.lock().unwrap().recv();
    });
    gpio.setup(15, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(15, Edge::Rising, Some(blocking), None)
        .unwrap();

    driver.inject_edge(15, Edge::Rising, 0).unwrap();
    assert_eq!(started_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 0);

    // queued while the first callback is still running
    for ts in [10, 20, 30] {
        driver.inject_edge(15, Edge::Rising, ts).unwrap();
    }
    assert_eq!(accepted(&gpio, 15), 4);

    drop(release_tx);
    assert_eq!(started_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 30);
    assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn callbacks_receive_accepted_edges_only() {
    let (driver, gpio) = interface();
    let (callback, rx) = channel_callback();
    gpio.setup(9, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(9, Edge::Rising, Some(callback), Some(50))
        .unwrap();

    driver.inject_edge(9, Edge::Rising, 0).unwrap();
    driver.inject_edge(9, Edge::Rising, 10).unwrap();
    driver.inject_edge(9, Edge::Rising, 100).unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((first.pin, first.edge, first.timestamp_ms), (9, Edge::Rising, 0));
    assert_eq!(second.timestamp_ms, 100);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn replacing_detection_resets_window_and_callbacks() {
    let (driver, gpio) = interface();
    let (old_callback, old_rx) = channel_callback();
    let (new_callback, new_rx) = channel_callback();
    gpio.setup(2, Direction::In, PullMode::Off).unwrap();

    gpio.add_event_detect(2, Edge::Rising, Some(old_callback), Some(50))
        .unwrap();
    driver.inject_edge(2, Edge::Rising, 0).unwrap();
    old_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    gpio.add_event_detect(2, Edge::Rising, Some(new_callback), Some(50))
        .unwrap();
    driver.inject_edge(2, Edge::Rising, 10).unwrap();

    let event = new_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.timestamp_ms, 10);
    assert_eq!(accepted(&gpio, 2), 1);
    assert!(old_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn added_callbacks_stack_and_update_window() {
    let (driver, gpio) = interface();
    let (first, first_rx) = channel_callback();
    let (second, second_rx) = channel_callback();
    gpio.setup(4, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(4, Edge::Falling, Some(first), None)
        .unwrap();

    gpio.add_event_callback(4, second, Some(30)).unwrap();
    assert_eq!(gpio.pin_status(4).unwrap().debounce_ms, Some(30));

    driver.inject_edge(4, Edge::Falling, 0).unwrap();
    driver.inject_edge(4, Edge::Falling, 5).unwrap();

    assert_eq!(first_rx.recv_timeout(Duration::from_secs(2)).unwrap().timestamp_ms, 0);
    assert_eq!(second_rx.recv_timeout(Duration::from_secs(2)).unwrap().timestamp_ms, 0);
    assert!(second_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn callback_needs_armed_detection() {
    let (_driver, gpio) = interface();
    let (callback, _rx) = channel_callback();
    gpio.setup(4, Direction::In, PullMode::Off).unwrap();

    assert!(matches!(
        gpio.add_event_callback(4, callback, None),
        Err(GpioError::InvalidState(_))
    ));
}

#[test]
fn panicking_callback_does_not_stop_dispatch() {
    let (driver, gpio) = interface();
    let (callback, rx) = channel_callback();
    let panicking: EdgeCallback = Arc::new(|_: &EdgeEvent| panic!("bad handler"));
    gpio.setup(6, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(6, Edge::Both, Some(panicking), None)
        .unwrap();
    gpio.add_event_callback(6, callback, None).unwrap();

    driver.inject_edge(6, Edge::Rising, 0).unwrap();
    driver.inject_edge(6, Edge::Falling, 1).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().edge, Edge::Rising);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().edge, Edge::Falling);
}

#[test]
fn input_pins_preserves_order_and_aborts_on_failure() {
    let (_driver, gpio) = interface();
    gpio.setup(1, Direction::In, PullMode::Up).unwrap();
    gpio.setup(2, Direction::In, PullMode::Down).unwrap();
    gpio.setup(3, Direction::Out, PullMode::Off).unwrap();

    assert_eq!(gpio.input_pins(&[2, 1, 2]).unwrap(), vec![false, true, false]);
    assert!(matches!(
        gpio.input_pins(&[1, 3, 2]),
        Err(GpioError::InvalidState(_))
    ));
    assert!(gpio.input_pins(&[]).unwrap().is_empty());
}

#[test]
fn wait_for_edge_returns_on_matching_edge() {
    let (driver, gpio) = interface();
    gpio.setup(12, Direction::In, PullMode::Down).unwrap();

    let waiter = {
        let gpio = gpio.clone();
        thread::spawn(move || gpio.wait_for_edge(12, Edge::Rising))
    };
    wait_until(|| driver.armed_edge(12) == Some(MockEdge::Rising));
    assert_eq!(gpio.pin_status(12).unwrap().waiters, 1);

    driver.drive(12, true).unwrap();

    assert!(waiter.join().unwrap().is_ok());
    assert_eq!(driver.armed_edge(12), None);
    assert_eq!(gpio.pin_status(12).unwrap().waiters, 0);
}

#[test]
fn wait_for_edge_timeout_expires_without_edges() {
    let (driver, gpio) = interface();
    gpio.setup(12, Direction::In, PullMode::Off).unwrap();

    let seen = gpio
        .wait_for_edge_timeout(12, Edge::Falling, Some(Duration::from_millis(30)))
        .unwrap();

    assert!(!seen);
    assert_eq!(driver.armed_edge(12), None);
}

#[test]
fn wait_widens_and_restores_existing_arming() {
    let (driver, gpio) = interface();
    gpio.setup(13, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(13, Edge::Rising, None, None).unwrap();

    let waiter = {
        let gpio = gpio.clone();
        thread::spawn(move || gpio.wait_for_edge(13, Edge::Falling))
    };
    wait_until(|| driver.armed_edge(13) == Some(MockEdge::Both));

    driver.inject_edge(13, Edge::Falling, 5).unwrap();
    assert!(waiter.join().unwrap().is_ok());

    // the falling edge woke the waiter without counting for the rising registration
    assert_eq!(accepted(&gpio, 13), 0);
    assert_eq!(driver.armed_edge(13), Some(MockEdge::Rising));
}

#[test]
fn cleanup_cancels_waiters_and_disarms_all_pins() {
    let (driver, gpio) = interface();
    gpio.setup(7, Direction::In, PullMode::Up).unwrap();
    gpio.setup(8, Direction::In, PullMode::Up).unwrap();
    gpio.add_event_detect(7, Edge::Rising, None, Some(50)).unwrap();
    gpio.add_event_detect(8, Edge::Falling, None, None).unwrap();

    let waiter = {
        let gpio = gpio.clone();
        thread::spawn(move || gpio.wait_for_edge(8, Edge::Falling))
    };
    wait_until(|| gpio.pin_status(8).map(|s| s.waiters) == Some(1));

    gpio.cleanup(None);

    assert!(matches!(waiter.join().unwrap(), Err(GpioError::Cancelled(_))));
    assert_eq!(gpio.detection_state(7), DetectionState::Unarmed);
    assert_eq!(gpio.detection_state(8), DetectionState::Unarmed);
    assert_eq!(driver.configured(7), None);
    assert_eq!(driver.configured(8), None);
    assert!(matches!(gpio.input(7), Err(GpioError::InvalidState(_))));
}

#[test]
fn cleanup_of_one_pin_leaves_others_armed() {
    let (driver, gpio) = interface();
    gpio.setup(1, Direction::In, PullMode::Off).unwrap();
    gpio.setup(2, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(1, Edge::Both, None, None).unwrap();
    gpio.add_event_detect(2, Edge::Both, None, None).unwrap();

    gpio.cleanup(Some(1));
    gpio.cleanup(Some(99));

    assert_eq!(gpio.detection_state(1), DetectionState::Unarmed);
    assert_eq!(gpio.detection_state(2), DetectionState::Armed);
    assert_eq!(driver.armed_edge(2), Some(MockEdge::Both));
}

#[test]
fn cleanup_swallows_driver_failures() {
    let (driver, gpio) = interface();
    gpio.setup(9, Direction::In, PullMode::Off).unwrap();
    gpio.add_event_detect(9, Edge::Rising, None, None).unwrap();
    driver.fail_pin(9, "line busy");

    gpio.cleanup(Some(9));

    assert_eq!(gpio.detection_state(9), DetectionState::Unarmed);
    assert!(matches!(gpio.input(9), Err(GpioError::InvalidState(_))));
}

#[test]
fn driver_failures_propagate() {
    let (driver, gpio) = interface();
    driver.fail_pin(10, "permission denied");

    assert!(matches!(
        gpio.setup(10, Direction::In, PullMode::Off),
        Err(GpioError::Driver(_))
    ));
    assert!(gpio.pin_status(10).is_none());

    driver.heal_pin(10);
    gpio.setup(10, Direction::In, PullMode::Off).unwrap();
    driver.fail_pin(10, "line busy");
    assert!(matches!(
        gpio.add_event_detect(10, Edge::Rising, None, None),
        Err(GpioError::Driver(_))
    ));
    assert_eq!(gpio.detection_state(10), DetectionState::Unarmed);
}

#[test]
fn unknown_mode_codes_are_configuration_errors() {
    assert_eq!(Direction::try_from(1).unwrap(), Direction::In);
    assert_eq!(PullMode::try_from(2).unwrap(), PullMode::Up);
    assert_eq!(Edge::try_from(3).unwrap(), Edge::Both);
    assert!(matches!(Direction::try_from(7), Err(GpioError::Configuration(_))));
    assert!(matches!(PullMode::try_from(3), Err(GpioError::Configuration(_))));
    assert!(matches!(Edge::try_from(0), Err(GpioError::Configuration(_))));

    assert_eq!("OUT".parse::<Direction>().unwrap(), Direction::Out);
    assert!(matches!("sideways".parse::<Direction>(), Err(GpioError::Configuration(_))));
    assert!(matches!("left".parse::<PullMode>(), Err(GpioError::Configuration(_))));
    assert!(matches!("sideways".parse::<Edge>(), Err(GpioError::Configuration(_))));
}
