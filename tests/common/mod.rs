#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vinmux::capture::sensor::ScenarioTable;
use vinmux::capture::sim::{SimHal, SimSensorFactory};
use vinmux::capture::Platform;
use vinmux::pipeline::{Observer, TransAttr};
use vinmux::{ChannelAttr, ChannelKey, FrameBuffer, PipeAttr, PipelineConfig, SensorConfig, SensorManager};

pub struct Rig {
    pub sim: Arc<SimHal>,
    pub factory: Arc<SimSensorFactory>,
    pub manager: SensorManager,
}

pub fn pipeline(timeout_ms: u64) -> PipelineConfig {
    PipelineConfig {
        yuv_timeout_ms: timeout_ms,
        raw_timeout_ms: timeout_ms,
        snapshot_timeout_ms: timeout_ms,
        poll_interval_ms: 1,
        ..PipelineConfig::default()
    }
}

pub fn pipe(pipe_id: u8, fps: f32) -> PipeAttr {
    PipeAttr {
        pipe_id,
        framerate: fps,
        channels: vec![ChannelAttr {
            channel: 0,
            width: 64,
            height: 64,
            framerate: fps,
            ..ChannelAttr::default()
        }],
        ..PipeAttr::default()
    }
}

pub fn sensor(sns_id: u8, dev_id: u8, pipes: Vec<PipeAttr>) -> SensorConfig {
    SensorConfig {
        sns_id,
        dev_id,
        framerate: 30.0,
        pipes,
        ..SensorConfig::default()
    }
}

/// Scenario 0: one sensor, pipes 0 (20fps) and 1 (10fps).
/// Scenario 1: that sensor plus a second one on dev 1 with pipe 2.
pub fn scenarios() -> BTreeMap<i32, Vec<SensorConfig>> {
    let first = sensor(0, 0, vec![pipe(0, 20.0), pipe(1, 10.0)]);
    let second = sensor(1, 1, vec![pipe(2, 30.0)]);
    let mut map = BTreeMap::new();
    map.insert(0, vec![first.clone()]);
    map.insert(1, vec![first, second]);
    map
}

pub fn rig_with(scenarios: BTreeMap<i32, Vec<SensorConfig>>, current: i32, pipeline: PipelineConfig) -> Rig {
    let sim = Arc::new(SimHal::new(Duration::from_millis(1)));
    let factory = Arc::new(SimSensorFactory::new(sim.clone()));
    let source = Arc::new(ScenarioTable::new(scenarios, current));
    let manager = SensorManager::new(pipeline, factory.clone(), source, Platform::from_single(sim.clone()));
    Rig { sim, factory, manager }
}

pub fn rig() -> Rig {
    rig_with(scenarios(), 0, pipeline(50))
}

/// Collect `n` frames, releasing each, or give up at `timeout`
pub fn take_frames(rx: &flume::Receiver<FrameBuffer>, n: usize, timeout: Duration) -> Vec<u64> {
    let deadline = Instant::now() + timeout;
    let mut seqs = Vec::new();
    while seqs.len() < n {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(frame) => {
                seqs.push(frame.sequence());
                frame.release();
            }
            Err(_) => break,
        }
    }
    seqs
}

pub fn drain(rx: &flume::Receiver<FrameBuffer>) {
    for frame in rx.try_iter() {
        frame.release();
    }
}

/// Counts frames and releases them right away
#[derive(Default)]
pub struct Counter {
    pub frames: AtomicUsize,
}

impl Counter {
    pub fn count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl Observer for Counter {
    fn on_register(&self, _key: ChannelKey, _attr: &TransAttr) -> bool {
        true
    }

    fn on_frame(&self, _key: ChannelKey, frame: &FrameBuffer) {
        self.frames.fetch_add(1, Ordering::SeqCst);
        frame.release();
    }
}
