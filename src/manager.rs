//! Sensor lifecycle and worker orchestration

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::{FrameBuffer, HdrMode};
use crate::capture::hal::Platform;
use crate::capture::sensor::{
    AttrUpdateHook, Sensor, SensorAttr, SensorConfig, SensorConfigSource, SensorFactory,
    SensorTopology, MAX_CHANNELS_PER_PIPE,
};
use crate::error::{HalError, Result, VinError};
use crate::pipeline::dispatch::{DispatchPlan, RawDispatcher, SensorGate};
use crate::pipeline::framerate::FrameRate;
use crate::pipeline::hub::FrameHub;
use crate::pipeline::observer::{Observer, TransAttr};
use crate::pipeline::queue::QueueStats;
use crate::pipeline::retrieval::YuvRetriever;
use crate::pipeline::tuning::TuningSession;
use crate::pipeline::worker::{stop_all, WorkerHandle};
use crate::{ChannelId, ChannelKey, PipeId, PipelineConfig};

/// Retrieval settings for one (pipe, channel)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvThreadParams {
    pub sns: usize,
    /// Snapshot-only channels get no retrieval thread
    pub snapshot: bool,
    pub multiplex: bool,
}

fn sensor_err(index: usize, op: &'static str) -> impl FnOnce(HalError) -> VinError {
    move |source| VinError::Sensor { index, op, source }
}

fn default_attr_hook() -> AttrUpdateHook {
    Arc::new(|cfg: &SensorConfig, attr: &mut SensorAttr| {
        debug!(
            "sensor {} attr: {:.2} fps, {:?}, mirror {}, flip {}",
            cfg.sns_id, attr.framerate, attr.hdr_mode, attr.mirror, attr.flip
        );
        true
    })
}

/// Owns the sensors, their workers, the in-flight queues and the observers.
///
/// Lifecycle calls take `&mut self` and are meant for one controlling
/// thread. Observer registration and frame release take `&self` and may come
/// from anywhere.
pub struct SensorManager {
    pipeline: PipelineConfig,
    factory: Arc<dyn SensorFactory>,
    source: Arc<dyn SensorConfigSource>,
    platform: Platform,
    attr_hook: AttrUpdateHook,
    sensors: Vec<Box<dyn Sensor>>,
    gates: Vec<Arc<SensorGate>>,
    hub: Arc<FrameHub>,
    dispatchers: Vec<WorkerHandle>,
    retrievers: Vec<WorkerHandle>,
    yuv_params: BTreeMap<ChannelKey, YuvThreadParams>,
    topology: Option<SensorTopology>,
    tuning: TuningSession,
    /// Set only once every sensor of the scenario initialized
    initialized: bool,
    running: bool,
}

impl SensorManager {
    pub fn new(
        pipeline: PipelineConfig,
        factory: Arc<dyn SensorFactory>,
        source: Arc<dyn SensorConfigSource>,
        platform: Platform,
    ) -> Self {
        let hub = FrameHub::new(platform.vin.clone(), pipeline.queue_depth);
        let tuning = TuningSession::new(platform.tuning.clone(), pipeline.tuning_stream_port);
        Self {
            pipeline,
            factory,
            source,
            platform,
            attr_hook: default_attr_hook(),
            sensors: Vec::new(),
            gates: Vec::new(),
            hub,
            dispatchers: Vec::new(),
            retrievers: Vec::new(),
            yuv_params: BTreeMap::new(),
            topology: None,
            tuning,
            initialized: false,
            running: false,
        }
    }

    /// Hook every sensor calls before it opens
    pub fn with_attr_hook(mut self, hook: AttrUpdateHook) -> Self {
        self.attr_hook = hook;
        self
    }

    /// Create and initialize every sensor of the current scenario.
    ///
    /// Stops at the first failure; sensors created so far stay owned by the
    /// manager so [`SensorManager::deinit`] can clean them up.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<()> {
        if !self.sensors.is_empty() {
            return Err(VinError::InvalidState("already initialized"));
        }
        let scenario = self.source.current_scenario();
        let count = self.source.sensor_count();
        if count == 0 {
            return Err(VinError::Config(format!(
                "scenario {scenario} has no sensor configured"
            )));
        }

        for index in 0..count {
            let cfg = self.source.sensor_config(index).ok_or_else(|| {
                VinError::Config(format!("scenario {scenario}: no config for sensor {index}"))
            })?;
            let mut sensor = self.factory.create(&cfg).map_err(|e| match e {
                VinError::Creation { reason, .. } => VinError::Creation { index, reason },
                other => VinError::Creation {
                    index,
                    reason: other.to_string(),
                },
            })?;
            sensor.register_attr_hook(self.attr_hook.clone());

            let res = sensor.init();
            self.sensors.push(sensor);
            if let Err(source) = res {
                error!("sensor {} init failed: {}", index, source);
                return Err(VinError::Init { index, source });
            }
            info!(
                "sensor {} ({:?}) on dev {} ready, {} pipes",
                index,
                cfg.kind,
                cfg.dev_id,
                cfg.pipes.len()
            );
        }

        let topology = SensorTopology::from_count(self.sensors.len());
        info!("scenario {} topology {:?}", scenario, topology);
        self.topology = Some(topology);

        for (index, sensor) in self.sensors.iter().enumerate() {
            let cfg = sensor.config();
            self.gates
                .push(Arc::new(SensorGate::new(DispatchPlan::from_config(index, cfg))));
            for pipe in &cfg.pipes {
                for chn in &pipe.channels {
                    self.yuv_params.insert(
                        ChannelKey::new(pipe.pipe_id, chn.channel),
                        YuvThreadParams {
                            sns: index,
                            snapshot: pipe.snapshot,
                            multiplex: chn.multiplex,
                        },
                    );
                }
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Close and destroy every sensor.
    ///
    /// Keeps going after a failed close so every instance is destroyed; the
    /// first close error is returned. Outstanding frames go back to hardware.
    #[instrument(skip(self))]
    pub fn deinit(&mut self) -> Result<()> {
        if self.running {
            return Err(VinError::InvalidState("deinit while running, stop first"));
        }

        let mut first_err = None;
        for (index, sensor) in self.sensors.iter_mut().enumerate() {
            if let Err(source) = sensor.close() {
                error!("sensor {} close failed: {}", index, source);
                if first_err.is_none() {
                    first_err = Some(VinError::Sensor {
                        index,
                        op: "close",
                        source,
                    });
                }
            }
        }
        for sensor in self.sensors.drain(..) {
            self.factory.destroy(sensor);
        }
        self.gates.clear();
        self.yuv_params.clear();
        self.topology = None;
        self.initialized = false;

        let returned = self.hub.clear();
        if returned > 0 {
            info!("{} in-flight frames returned to hardware", returned);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Open sensors, start their ISP loops, then tuning, retrieval and
    /// dispatch workers.
    ///
    /// A failing sensor aborts the start without undoing the sensors already
    /// started; call [`SensorManager::stop`] to clean up.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(VinError::InvalidState("start before init"));
        }
        if self.running {
            return Err(VinError::InvalidState("already running"));
        }
        self.running = true;

        for (index, sensor) in self.sensors.iter_mut().enumerate() {
            sensor.open().map_err(sensor_err(index, "open"))?;
            sensor
                .start_isp_loop()
                .map_err(sensor_err(index, "start_isp_loop"))?;
        }

        let configs: Vec<SensorConfig> = self.sensors.iter().map(|s| s.config().clone()).collect();
        self.tuning.start(&configs);

        self.hub.ensure_queues(self.yuv_params.keys().copied());
        self.spawn_retrievers()?;
        self.spawn_dispatchers()?;
        info!(
            "started {} dispatch and {} retrieval workers",
            self.dispatchers.len(),
            self.retrievers.len()
        );
        Ok(())
    }

    fn spawn_retrievers(&mut self) -> Result<()> {
        for (key, params) in &self.yuv_params {
            if params.snapshot {
                continue;
            }
            let gate = self
                .gates
                .get(params.sns)
                .cloned()
                .ok_or(VinError::NoSuchSensor(params.sns))?;
            let retriever =
                YuvRetriever::new(*key, params.multiplex, gate, self.hub.clone(), &self.pipeline);
            let worker = WorkerHandle::spawn(
                format!("YUV_Get_{}_{}", key.pipe, key.channel),
                self.pipeline.retrieval_cpu,
                move |stop| retriever.run(stop),
            )?;
            self.retrievers.push(worker);
        }
        Ok(())
    }

    fn spawn_dispatchers(&mut self) -> Result<()> {
        for (index, gate) in self.gates.iter().enumerate() {
            let dev = gate.plan().dev;
            let custom = self.sensors.get(index).and_then(|s| s.snapshot_proc());
            let dispatcher = RawDispatcher::new(
                gate.clone(),
                self.hub.clone(),
                self.platform.iq.clone(),
                &self.pipeline,
            )
            .with_snapshot_proc(custom);
            let worker = WorkerHandle::spawn(
                format!("RAW_DISP_{dev}"),
                self.pipeline.dispatch_cpu,
                move |stop| dispatcher.run(stop),
            )?;
            self.dispatchers.push(worker);
        }
        Ok(())
    }

    /// Stop tuning, retrieval and dispatch workers, then the sensors' ISP loops.
    ///
    /// All workers are signalled before the first join, so the wait is bounded
    /// by the longest single hardware timeout.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<()> {
        self.tuning.stop();

        for worker in self.retrievers.iter().chain(self.dispatchers.iter()) {
            worker.request_stop();
        }
        stop_all(&mut self.retrievers);
        stop_all(&mut self.dispatchers);
        self.running = false;

        for (index, sensor) in self.sensors.iter_mut().enumerate() {
            sensor
                .stop_isp_loop()
                .map_err(sensor_err(index, "stop_isp_loop"))?;
        }
        info!("stopped");
        Ok(())
    }

    /// Full stop / deinit / init / start cycle on another scenario.
    /// Fails at the first failing stage and leaves that stage's state behind.
    #[instrument(skip(self))]
    pub fn restart_with_scenario(&mut self, scenario: i32) -> Result<()> {
        self.stop()?;
        self.deinit()?;
        self.source.select_scenario(scenario);
        self.init()?;
        self.start()
    }

    /// Reopen one sensor in another HDR mode while the others keep streaming.
    ///
    /// The sensor's workers are paused for the duration and stay paused if
    /// any step fails.
    #[instrument(skip(self))]
    pub fn switch_sensor_mode(&mut self, index: usize, mode: HdrMode) -> Result<()> {
        let gate = self
            .gates
            .get(index)
            .cloned()
            .ok_or(VinError::NoSuchSensor(index))?;
        let sensor = self
            .sensors
            .get_mut(index)
            .ok_or(VinError::NoSuchSensor(index))?;

        gate.pause();
        sensor
            .stop_isp_loop()
            .map_err(sensor_err(index, "stop_isp_loop"))?;
        sensor.close().map_err(sensor_err(index, "close"))?;
        sensor
            .change_hdr_mode(mode)
            .map_err(sensor_err(index, "change_hdr_mode"))?;
        gate.update(|plan| DispatchPlan {
            hdr_mode: mode,
            ..plan.clone()
        });
        sensor.init().map_err(sensor_err(index, "init"))?;
        sensor.open().map_err(sensor_err(index, "open"))?;
        sensor
            .start_isp_loop()
            .map_err(sensor_err(index, "start_isp_loop"))?;
        gate.resume();

        info!("sensor {} switched to {:?}", index, mode);
        Ok(())
    }

    /// Change the device frame rate. The dispatcher re-plans its pipe split at
    /// its next tick.
    #[instrument(skip(self))]
    pub fn change_sensor_fps(&mut self, index: usize, fps: f32) -> Result<()> {
        let sensor = self
            .sensors
            .get_mut(index)
            .ok_or(VinError::NoSuchSensor(index))?;
        let mut attr = sensor.attr();
        attr.framerate = fps;
        sensor.set_attr(attr);
        sensor
            .apply_attr()
            .map_err(sensor_err(index, "apply_attr"))?;

        if let Some(gate) = self.gates.get(index) {
            gate.update(|plan| DispatchPlan {
                device_rate: FrameRate::from_fps(fps),
                ..plan.clone()
            });
        }
        info!("sensor {} fps -> {:.2}", index, fps);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn change_mirror_flip(&mut self, index: usize, mirror: bool, flip: bool) -> Result<()> {
        let sensor = self
            .sensors
            .get_mut(index)
            .ok_or(VinError::NoSuchSensor(index))?;
        let mut attr = sensor.attr();
        attr.mirror = mirror;
        attr.flip = flip;
        sensor.set_attr(attr);
        sensor
            .apply_attr()
            .map_err(sensor_err(index, "apply_attr"))
    }

    /// Offer `observer` the frames of (pipe, chn). Returns whether it accepted.
    pub fn register_observer(
        &self,
        pipe: PipeId,
        chn: ChannelId,
        observer: Arc<dyn Observer>,
    ) -> Result<bool> {
        let index = self.pipe_to_sensor(pipe).ok_or(VinError::UnknownPipe(pipe))?;
        let key = ChannelKey::new(pipe, chn);
        let chn_attr = self
            .sensors
            .get(index)
            .and_then(|s| s.channel_attr(pipe, chn))
            .ok_or_else(|| VinError::Config(format!("{key} is not configured")))?;

        let attr = TransAttr {
            group: pipe,
            channel: chn,
            framerate: chn_attr.framerate,
            width: chn_attr.width,
            height: chn_attr.height,
            compressed: chn_attr.compressed,
            link: false,
            sensor_index: index,
        };
        if !observer.on_register(key, &attr) {
            debug!("{} observer {} declined", key, observer.name());
            return Ok(false);
        }
        self.hub.registry().add(key, observer);
        Ok(true)
    }

    pub fn unregister_observer(&self, pipe: PipeId, chn: ChannelId, observer: &Arc<dyn Observer>) -> bool {
        self.hub
            .registry()
            .remove(ChannelKey::new(pipe, chn), observer)
    }

    /// Give a frame back; see [`FrameBuffer::release`]
    pub fn video_frame_release(&self, frame: &FrameBuffer) {
        self.hub.release(frame);
    }

    /// Override the retrieval settings derived from config. Takes effect at
    /// the next start.
    pub fn set_yuv_thread_params(
        &mut self,
        sns: usize,
        pipe: PipeId,
        chn: ChannelId,
        snapshot: bool,
        multiplex: bool,
    ) {
        if usize::from(chn) >= MAX_CHANNELS_PER_PIPE {
            warn!("[{}][{}] channel out of range, ignored", pipe, chn);
            return;
        }
        self.yuv_params.insert(
            ChannelKey::new(pipe, chn),
            YuvThreadParams {
                sns,
                snapshot,
                multiplex,
            },
        );
    }

    pub fn yuv_thread_params(&self, pipe: PipeId, chn: ChannelId) -> Option<YuvThreadParams> {
        self.yuv_params.get(&ChannelKey::new(pipe, chn)).copied()
    }

    pub fn sensor(&self, index: usize) -> Option<&dyn Sensor> {
        self.sensors.get(index).map(|s| s.as_ref())
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Index of the sensor owning `pipe`
    pub fn pipe_to_sensor(&self, pipe: PipeId) -> Option<usize> {
        self.sensors
            .iter()
            .position(|s| s.config().pipe(pipe).is_some())
    }

    pub fn topology(&self) -> Option<SensorTopology> {
        self.topology
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn queue_stats(&self) -> Vec<(ChannelKey, QueueStats)> {
        self.hub.stats()
    }

    pub fn in_flight(&self, pipe: PipeId, chn: ChannelId) -> usize {
        self.hub.in_flight(ChannelKey::new(pipe, chn))
    }

    pub fn hub(&self) -> &Arc<FrameHub> {
        &self.hub
    }
}

impl Drop for SensorManager {
    fn drop(&mut self) {
        if self.running {
            if let Err(e) = self.stop() {
                error!("stop on drop failed: {}", e);
            }
        }
        if !self.sensors.is_empty() {
            if let Err(e) = self.deinit() {
                error!("deinit on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sensor::{ChannelAttr, PipeAttr, ScenarioTable};
    use crate::capture::sim::{SimHal, SimSensorFactory};
    use crate::pipeline::observer::ChannelObserver;
    use std::time::Duration;

    fn sensor_cfg() -> SensorConfig {
        SensorConfig {
            pipes: vec![
                PipeAttr {
                    pipe_id: 0,
                    framerate: 20.0,
                    channels: vec![
                        ChannelAttr {
                            channel: 0,
                            width: 640,
                            framerate: 20.0,
                            ..ChannelAttr::default()
                        },
                        ChannelAttr {
                            channel: 1,
                            width: 320,
                            framerate: 20.0,
                            multiplex: true,
                            ..ChannelAttr::default()
                        },
                    ],
                    ..PipeAttr::default()
                },
                PipeAttr {
                    pipe_id: 1,
                    framerate: 10.0,
                    snapshot: true,
                    ..PipeAttr::default()
                },
            ],
            ..SensorConfig::default()
        }
    }

    fn manager() -> (Arc<SimHal>, Arc<SimSensorFactory>, SensorManager) {
        let sim = Arc::new(SimHal::new(Duration::from_millis(1)));
        let factory = Arc::new(SimSensorFactory::new(sim.clone()));
        let mut scenarios = BTreeMap::new();
        scenarios.insert(0, vec![sensor_cfg()]);
        let source = Arc::new(ScenarioTable::new(scenarios, 0));
        let pipeline = PipelineConfig {
            yuv_timeout_ms: 20,
            raw_timeout_ms: 20,
            snapshot_timeout_ms: 20,
            poll_interval_ms: 1,
            ..PipelineConfig::default()
        };
        let mgr = SensorManager::new(pipeline, factory.clone(), source, Platform::from_single(sim.clone()));
        (sim, factory, mgr)
    }

    #[test]
    fn init_builds_params_and_topology() {
        let (_sim, _factory, mut mgr) = manager();
        mgr.init().unwrap();
        assert_eq!(mgr.sensor_count(), 1);
        assert_eq!(mgr.topology(), Some(SensorTopology::Single));
        assert_eq!(mgr.pipe_to_sensor(1), Some(0));
        assert_eq!(mgr.pipe_to_sensor(4), None);
        assert_eq!(
            mgr.yuv_thread_params(0, 1),
            Some(YuvThreadParams {
                sns: 0,
                snapshot: false,
                multiplex: true
            })
        );
        assert!(mgr.yuv_thread_params(1, 0).is_some_and(|p| p.snapshot));
        assert!(matches!(mgr.init(), Err(VinError::InvalidState(_))));
    }

    #[test]
    fn yuv_params_override_bounds() {
        let (_sim, _factory, mut mgr) = manager();
        mgr.init().unwrap();
        mgr.set_yuv_thread_params(0, 0, 0, false, true);
        mgr.set_yuv_thread_params(0, 0, 3, false, true);
        assert!(mgr.yuv_thread_params(0, 0).is_some_and(|p| p.multiplex));
        assert!(mgr.yuv_thread_params(0, 3).is_none());
    }

    #[test]
    fn observer_gets_channel_attributes() {
        let (_sim, _factory, mut mgr) = manager();
        mgr.init().unwrap();

        struct Inspect(std::sync::Mutex<Option<TransAttr>>);
        impl Observer for Inspect {
            fn on_register(&self, _key: ChannelKey, attr: &TransAttr) -> bool {
                *self.0.lock().unwrap() = Some(attr.clone());
                attr.width >= 640
            }
            fn on_frame(&self, _key: ChannelKey, frame: &FrameBuffer) {
                frame.release();
            }
        }

        let probe = Arc::new(Inspect(std::sync::Mutex::new(None)));
        assert!(mgr.register_observer(0, 0, probe.clone()).unwrap());
        assert!(!mgr.register_observer(0, 1, probe.clone()).unwrap());
        let seen = probe.0.lock().unwrap().clone().unwrap();
        assert_eq!((seen.group, seen.channel, seen.width), (0, 1, 320));
        assert!(!seen.link);

        assert!(matches!(
            mgr.register_observer(9, 0, probe.clone()),
            Err(VinError::UnknownPipe(9))
        ));
        let (enc, _rx) = ChannelObserver::bounded("enc", None, 1);
        assert!(mgr.register_observer(0, 2, enc).is_err());
    }

    #[test]
    fn lifecycle_guards() {
        let (_sim, factory, mut mgr) = manager();
        assert!(matches!(mgr.start(), Err(VinError::InvalidState(_))));
        mgr.init().unwrap();
        mgr.start().unwrap();
        assert!(matches!(mgr.deinit(), Err(VinError::InvalidState(_))));
        mgr.stop().unwrap();
        mgr.deinit().unwrap();
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn mirror_flip_applied() {
        let (_sim, _factory, mut mgr) = manager();
        mgr.init().unwrap();
        mgr.start().unwrap();
        mgr.change_mirror_flip(0, true, false).unwrap();
        let attr = mgr.sensor(0).map(|s| s.attr()).unwrap();
        assert!(attr.mirror && !attr.flip);
        assert!(matches!(
            mgr.change_mirror_flip(3, true, true),
            Err(VinError::NoSuchSensor(3))
        ));
        mgr.stop().unwrap();
    }
}
