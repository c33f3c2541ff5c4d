mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{drain, pipe, pipeline, rig, rig_with, scenarios, sensor, take_frames, Counter};
use vinmux::capture::sensor::SensorTopology;
use vinmux::pipeline::{ChannelObserver, Observer};
use vinmux::{ChannelKey, HdrMode, VinError};

#[test]
fn init_deinit_cycles() {
    let mut rig = rig();
    for _ in 0..3 {
        rig.manager.init().unwrap();
        assert_eq!(rig.manager.sensor_count(), 1);
        rig.manager.deinit().unwrap();
        assert_eq!(rig.manager.sensor_count(), 0);
    }
    assert_eq!(rig.factory.created(), 3);
    assert_eq!(rig.factory.live(), 0);
}

#[test]
fn frames_flow_and_come_back() {
    let mut rig = rig();
    rig.manager.init().unwrap();
    let (observer, rx) = ChannelObserver::bounded("enc", None, 16);
    assert!(rig.manager.register_observer(0, 0, observer).unwrap());
    rig.manager.start().unwrap();

    let seqs = take_frames(&rx, 10, Duration::from_secs(5));
    assert_eq!(seqs.len(), 10);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    rig.manager.stop().unwrap();
    drain(&rx);
    assert_eq!(rig.sim.outstanding_yuv(), 0);
    assert_eq!(rig.sim.outstanding_raw(), 0);
    assert!(rig.sim.max_release_count() <= 1);
    rig.manager.deinit().unwrap();
}

#[test]
fn unobserved_channels_leak_nothing() {
    let mut rig = rig();
    rig.manager.init().unwrap();
    rig.manager.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    rig.manager.stop().unwrap();

    assert!(rig.sim.released_frames(ChannelKey::new(0, 0)) > 0);
    assert_eq!(rig.sim.outstanding_yuv(), 0);
    assert_eq!(rig.manager.in_flight(0, 0), 0);
    assert_eq!(rig.sim.max_release_count(), 1);
    rig.manager.deinit().unwrap();
}

#[test]
fn stop_bounded_by_timeout_when_stalled() {
    let mut rig = rig_with(scenarios(), 1, pipeline(200));
    rig.manager.init().unwrap();
    rig.manager.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    rig.sim.set_stalled(true);
    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    rig.manager.stop().unwrap();
    let took = start.elapsed();
    assert!(took < Duration::from_millis(700), "stop took {took:?}");

    rig.sim.set_stalled(false);
    rig.manager.deinit().unwrap();
}

#[test]
fn stop_bounded_by_timeout_when_stalled_in_hdr4() {
    let mut cfg = sensor(0, 0, vec![pipe(0, 30.0)]);
    cfg.hdr_mode = HdrMode::Hdr4;
    let mut map = BTreeMap::new();
    map.insert(0, vec![cfg]);
    let mut rig = rig_with(map, 0, pipeline(200));
    rig.manager.init().unwrap();
    rig.manager.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(rig.sim.raw_frames_sent(0) > 0);

    rig.sim.set_stalled(true);
    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    rig.manager.stop().unwrap();
    let took = start.elapsed();
    // one sub-frame timeout per tick, not four
    assert!(took < Duration::from_millis(500), "stop took {took:?}");

    rig.sim.set_stalled(false);
    assert_eq!(rig.sim.outstanding_raw(), 0);
    rig.manager.deinit().unwrap();
}

#[test]
fn unregistered_observer_sees_nothing() {
    let mut rig = rig();
    rig.manager.init().unwrap();
    let counter = Arc::new(Counter::default());
    let observer: Arc<dyn Observer> = counter.clone();
    assert!(rig.manager.register_observer(0, 0, observer.clone()).unwrap());
    assert!(rig.manager.unregister_observer(0, 0, &observer));
    assert!(!rig.manager.unregister_observer(0, 0, &observer));

    rig.manager.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    rig.manager.stop().unwrap();
    assert_eq!(counter.count(), 0);
    rig.manager.deinit().unwrap();
}

#[test]
fn failed_init_is_cleaned_by_deinit() {
    let mut rig = rig_with(scenarios(), 1, pipeline(50));
    rig.sim.inject_fault("init", 1);

    let err = rig.manager.init().unwrap_err();
    assert!(matches!(err, VinError::Init { index: 1, .. }));
    assert_eq!(rig.manager.sensor_count(), 2);

    rig.manager.deinit().unwrap();
    assert_eq!(rig.factory.live(), 0);

    rig.sim.clear_faults();
    rig.manager.init().unwrap();
    assert_eq!(rig.manager.topology(), Some(SensorTopology::Dual));
    rig.manager.deinit().unwrap();
}

#[test]
fn refused_sensor_is_a_creation_error() {
    let mut rig = rig_with(scenarios(), 1, pipeline(50));
    rig.factory.refuse(1);
    assert!(matches!(
        rig.manager.init(),
        Err(VinError::Creation { index: 1, .. })
    ));
    assert_eq!(rig.manager.sensor_count(), 1);
    assert!(matches!(rig.manager.start(), Err(VinError::InvalidState(_))));
    assert!(!rig.sim.is_streaming(0));
    assert!(!rig.manager.is_running());
    rig.manager.deinit().unwrap();
    assert_eq!(rig.factory.live(), 0);
}

#[test]
fn empty_scenario_is_a_config_error() {
    let mut rig = rig_with(BTreeMap::new(), 0, pipeline(50));
    assert!(matches!(rig.manager.init(), Err(VinError::Config(_))));
}

#[test]
fn deinit_destroys_all_despite_close_failure() {
    let mut rig = rig_with(scenarios(), 1, pipeline(50));
    rig.manager.init().unwrap();
    rig.manager.start().unwrap();
    rig.manager.stop().unwrap();

    rig.sim.inject_fault("close", 0);
    let err = rig.manager.deinit().unwrap_err();
    assert!(matches!(err, VinError::Sensor { index: 0, op: "close", .. }));
    assert_eq!(rig.factory.live(), 0);
    assert_eq!(rig.manager.sensor_count(), 0);
    // the second sensor still got closed
    assert!(!rig.sim.is_pipe_open(2));
}

#[test]
fn start_failure_needs_explicit_stop() {
    let mut rig = rig_with(scenarios(), 1, pipeline(50));
    rig.sim.inject_fault("open", 1);
    rig.manager.init().unwrap();

    assert!(matches!(
        rig.manager.start(),
        Err(VinError::Sensor { index: 1, op: "open", .. })
    ));
    assert!(rig.sim.is_streaming(0));

    rig.manager.stop().unwrap();
    assert!(!rig.sim.is_streaming(0));
    rig.manager.deinit().unwrap();
}

#[test]
fn restart_with_other_scenario() {
    let mut rig = rig();
    rig.manager.init().unwrap();
    rig.manager.start().unwrap();
    assert_eq!(rig.manager.topology(), Some(SensorTopology::Single));

    rig.manager.restart_with_scenario(1).unwrap();
    assert!(rig.manager.is_running());
    assert_eq!(rig.manager.sensor_count(), 2);
    assert_eq!(rig.manager.topology(), Some(SensorTopology::Dual));
    assert_eq!(rig.manager.pipe_to_sensor(2), Some(1));

    let (observer, rx) = ChannelObserver::bounded("second", None, 16);
    assert!(rig.manager.register_observer(2, 0, observer).unwrap());
    assert_eq!(take_frames(&rx, 5, Duration::from_secs(5)).len(), 5);

    rig.manager.stop().unwrap();
    drain(&rx);
    rig.manager.deinit().unwrap();
    assert_eq!(rig.factory.live(), 0);
}

#[test]
fn held_frames_returned_on_deinit() {
    let mut rig = rig_with(
        {
            let mut map = BTreeMap::new();
            map.insert(0, vec![sensor(0, 0, vec![pipe(0, 30.0)])]);
            map
        },
        0,
        pipeline(50),
    );
    rig.manager.init().unwrap();
    let (observer, rx) = ChannelObserver::bounded("hoarder", None, 64);
    assert!(rig.manager.register_observer(0, 0, observer).unwrap());
    rig.manager.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    rig.manager.stop().unwrap();

    // nothing released by the consumer: the queue bound holds
    assert!(rig.manager.in_flight(0, 0) <= 5);
    let stats = rig.manager.queue_stats();
    assert!(stats.iter().any(|(key, s)| *key == ChannelKey::new(0, 0) && s.dropped > 0));

    rig.manager.deinit().unwrap();
    assert_eq!(rig.sim.outstanding_yuv(), 0);
    // late releases after teardown are no-ops
    drain(&rx);
    assert_eq!(rig.sim.max_release_count(), 1);
}
