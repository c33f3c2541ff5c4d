//! Simulated SoC: capture devices, ISP pipes and sensors without hardware.
//!
//! Devices produce one raw frame per `frame_interval` while streaming, pipes
//! turn every raw frame pushed into them into one YUV frame per channel. All
//! buffers handed out are counted so tests can check nothing leaks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace};

use crate::capture::frame::{FrameSource, HdrMode, RawImage, YuvImage};
use crate::capture::hal::{AeParam, AinrParam, AwbParam, IspIq, TuningCtrl, VinHal};
use crate::capture::sensor::{
    AttrUpdateHook, Sensor, SensorAttr, SensorConfig, SensorFactory, SensorKind,
};
use crate::error::{HalError, HalResult, VinError};
use crate::pipeline::snapshot::SnapshotProc;
use crate::{ChannelId, ChannelKey, DevId, PipeId};

/// Hardware output FIFO depth per channel
const YUV_FIFO_DEPTH: usize = 8;

static PATTERN: [u8; 64] = [0x80; 64];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct DevState {
    streaming: bool,
    seq: u64,
    framerate: f32,
    flash_tags: Vec<PipeId>,
    tag_pos: usize,
    current_tag: PipeId,
}

#[derive(Debug, Default)]
struct PipeState {
    open: bool,
    channels: Vec<(ChannelId, u32, u32)>,
    seq: u64,
    isp_runs: u32,
    raw_sent: u64,
}

#[derive(Debug, Clone)]
struct IqState {
    ae: AeParam,
    awb: AwbParam,
    ainr: AinrParam,
}

impl Default for IqState {
    fn default() -> Self {
        Self {
            ae: AeParam {
                enable: true,
                exposure_us: 10_000,
                again: 1.0,
                dgain: 1.0,
            },
            awb: AwbParam {
                enable: true,
                r_gain: 1.0,
                b_gain: 1.0,
            },
            ainr: AinrParam {
                auto_mode: true,
                ..AinrParam::default()
            },
        }
    }
}

type Fifo = (Sender<YuvImage>, Receiver<YuvImage>);

/// Simulated capture / ISP / tuning backend
pub struct SimHal {
    frame_interval: Duration,
    epoch: Instant,
    devices: Mutex<HashMap<DevId, DevState>>,
    pipes: Mutex<HashMap<PipeId, PipeState>>,
    fifos: Mutex<HashMap<ChannelKey, Fifo>>,
    iq: Mutex<HashMap<PipeId, IqState>>,
    releases: Mutex<HashMap<(ChannelKey, u64), u32>>,
    faults: Mutex<HashSet<(&'static str, DevId)>>,
    tuning_calls: Mutex<Vec<String>>,
    stalled: AtomicBool,
    outstanding_raw: AtomicI64,
    outstanding_yuv: AtomicI64,
    yuv_overwritten: AtomicUsize,
}

impl SimHal {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            epoch: Instant::now(),
            devices: Mutex::new(HashMap::new()),
            pipes: Mutex::new(HashMap::new()),
            fifos: Mutex::new(HashMap::new()),
            iq: Mutex::new(HashMap::new()),
            releases: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashSet::new()),
            tuning_calls: Mutex::new(Vec::new()),
            stalled: AtomicBool::new(false),
            outstanding_raw: AtomicI64::new(0),
            outstanding_yuv: AtomicI64::new(0),
            yuv_overwritten: AtomicUsize::new(0),
        }
    }

    pub fn open_device(&self, dev: DevId, framerate: f32) {
        let mut devices = lock(&self.devices);
        let state = devices.entry(dev).or_default();
        state.framerate = framerate;
        info!("sim dev {} opened @ {:.2} fps", dev, framerate);
    }

    pub fn close_device(&self, dev: DevId) {
        lock(&self.devices).remove(&dev);
    }

    /// Open a pipe with `(channel, width, height)` outputs
    pub fn open_pipe(&self, pipe: PipeId, channels: &[(ChannelId, u32, u32)]) {
        let mut fifos = lock(&self.fifos);
        for (chn, _, _) in channels {
            fifos
                .entry(ChannelKey::new(pipe, *chn))
                .or_insert_with(|| channel::bounded(YUV_FIFO_DEPTH));
        }
        drop(fifos);
        // Counters survive a close/open cycle, like the hardware sequence
        let mut pipes = lock(&self.pipes);
        let state = pipes.entry(pipe).or_default();
        state.open = true;
        state.channels = channels.to_vec();
    }

    pub fn close_pipe(&self, pipe: PipeId) {
        let channels = match lock(&self.pipes).get_mut(&pipe) {
            Some(state) if state.open => {
                state.open = false;
                std::mem::take(&mut state.channels)
            }
            _ => return,
        };
        let fifos = lock(&self.fifos);
        for (chn, _, _) in channels {
            if let Some((_, rx)) = fifos.get(&ChannelKey::new(pipe, chn)) {
                while rx.try_recv().is_ok() {}
            }
        }
    }

    pub fn is_pipe_open(&self, pipe: PipeId) -> bool {
        lock(&self.pipes).get(&pipe).map_or(false, |p| p.open)
    }

    pub fn start_streaming(&self, dev: DevId) -> HalResult<()> {
        let mut devices = lock(&self.devices);
        let state = devices
            .get_mut(&dev)
            .ok_or(HalError::status("start_isp_loop", -1))?;
        state.streaming = true;
        Ok(())
    }

    pub fn stop_streaming(&self, dev: DevId) {
        if let Some(state) = lock(&self.devices).get_mut(&dev) {
            state.streaming = false;
        }
    }

    pub fn is_streaming(&self, dev: DevId) -> bool {
        lock(&self.devices).get(&dev).map_or(false, |d| d.streaming)
    }

    pub fn set_device_rate(&self, dev: DevId, framerate: f32) -> HalResult<()> {
        let mut devices = lock(&self.devices);
        let state = devices
            .get_mut(&dev)
            .ok_or(HalError::status("set_sns_attr", -1))?;
        state.framerate = framerate;
        Ok(())
    }

    pub fn device_rate(&self, dev: DevId) -> Option<f32> {
        lock(&self.devices).get(&dev).map(|d| d.framerate)
    }

    /// Pipe tags stamped on successive raw frames, cycled. Empty means tag 0.
    pub fn set_flash_tags(&self, dev: DevId, tags: Vec<PipeId>) {
        let mut devices = lock(&self.devices);
        let state = devices.entry(dev).or_default();
        state.flash_tags = tags;
        state.tag_pos = 0;
    }

    /// Make every blocking get wait out its full timeout
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    /// Fail sensor operation `op` ("init", "open", "close", ...) on `dev`.
    /// Tuning calls ("stream_init", "ctrl_init") are keyed on dev 0.
    pub fn inject_fault(&self, op: &'static str, dev: DevId) {
        lock(&self.faults).insert((op, dev));
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    fn check_fault(&self, op: &'static str, dev: DevId) -> HalResult<()> {
        if lock(&self.faults).contains(&(op, dev)) {
            Err(HalError::status(op, -1))
        } else {
            Ok(())
        }
    }

    pub fn outstanding_raw(&self) -> i64 {
        self.outstanding_raw.load(Ordering::Acquire)
    }

    pub fn outstanding_yuv(&self) -> i64 {
        self.outstanding_yuv.load(Ordering::Acquire)
    }

    /// How often the buffer `(key, seq)` was handed back
    pub fn yuv_release_count(&self, key: ChannelKey, seq: u64) -> u32 {
        lock(&self.releases).get(&(key, seq)).copied().unwrap_or(0)
    }

    /// Largest release count seen for any buffer; above 1 is a double release
    pub fn max_release_count(&self) -> u32 {
        lock(&self.releases).values().copied().max().unwrap_or(0)
    }

    /// Buffers of `key` handed back at least once
    pub fn released_frames(&self, key: ChannelKey) -> usize {
        lock(&self.releases).keys().filter(|(k, _)| *k == key).count()
    }

    pub fn isp_runs(&self, pipe: PipeId) -> u32 {
        lock(&self.pipes).get(&pipe).map_or(0, |p| p.isp_runs)
    }

    pub fn raw_frames_sent(&self, pipe: PipeId) -> u64 {
        lock(&self.pipes).get(&pipe).map_or(0, |p| p.raw_sent)
    }

    /// YUV frames the hardware had to drop because nobody pulled them
    pub fn yuv_overwritten(&self) -> usize {
        self.yuv_overwritten.load(Ordering::Relaxed)
    }

    pub fn tuning_calls(&self) -> Vec<String> {
        lock(&self.tuning_calls).clone()
    }

    fn stall(&self, timeout: Duration) -> HalError {
        thread::sleep(timeout);
        HalError::Timeout(timeout)
    }

    fn fifo_rx(&self, key: ChannelKey) -> Receiver<YuvImage> {
        lock(&self.fifos)
            .entry(key)
            .or_insert_with(|| channel::bounded(YUV_FIFO_DEPTH))
            .1
            .clone()
    }
}

impl VinHal for SimHal {
    fn get_raw_frame(
        &self,
        dev: DevId,
        hdr_index: usize,
        timeout: Duration,
    ) -> HalResult<RawImage> {
        if self.stalled.load(Ordering::Acquire) {
            return Err(self.stall(timeout));
        }
        if !self.is_streaming(dev) {
            thread::sleep(timeout.min(self.frame_interval));
            return Err(HalError::Timeout(timeout));
        }
        if hdr_index == 0 {
            thread::sleep(self.frame_interval);
        }

        let mut devices = lock(&self.devices);
        let state = match devices.get_mut(&dev) {
            Some(state) if state.streaming => state,
            _ => return Err(HalError::Timeout(timeout)),
        };
        if hdr_index == 0 {
            state.seq += 1;
            state.current_tag = if state.flash_tags.is_empty() {
                0
            } else {
                let tag = state.flash_tags[state.tag_pos % state.flash_tags.len()];
                state.tag_pos += 1;
                tag
            };
        }
        let frame = RawImage {
            dev,
            hdr_index,
            seq: state.seq,
            width: 64,
            height: 64,
            pts: self.epoch.elapsed(),
            phy_addr: 0x4000_0000 + (u64::from(dev) << 24) + state.seq * 0x1000,
            pipe_tag: state.current_tag,
        };
        drop(devices);

        self.outstanding_raw.fetch_add(1, Ordering::AcqRel);
        trace!("sim dev {} raw seq {} hdr {}", dev, frame.seq, hdr_index);
        Ok(frame)
    }

    fn send_raw_frame(
        &self,
        pipe: PipeId,
        _source: FrameSource,
        hdr_mode: HdrMode,
        frames: &[RawImage],
    ) -> HalResult<()> {
        if frames.len() != hdr_mode.frame_count() {
            return Err(HalError::status("send_raw_frame", -2));
        }
        let mut pipes = lock(&self.pipes);
        let state = pipes
            .get_mut(&pipe)
            .filter(|p| p.open)
            .ok_or(HalError::status("send_raw_frame", -1))?;
        state.raw_sent += 1;
        let seq = state.seq;
        state.seq += 1;
        let channels = state.channels.clone();
        drop(pipes);

        let fifos = lock(&self.fifos);
        for (chn, width, height) in channels {
            let image = YuvImage {
                pipe,
                channel: chn,
                seq,
                width,
                height,
                stride: width,
                pts: frames[0].pts,
                phy_addr: 0x8000_0000 + (u64::from(pipe) << 24) + seq * 0x1000,
                vir_addr: 0,
                data: Bytes::from_static(&PATTERN),
            };
            if let Some((tx, _)) = fifos.get(&ChannelKey::new(pipe, chn)) {
                if tx.try_send(image).is_err() {
                    self.yuv_overwritten.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn release_raw_frame(&self, _dev: DevId, _hdr_index: usize, _frame: &RawImage) -> HalResult<()> {
        self.outstanding_raw.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn get_yuv_frame(
        &self,
        pipe: PipeId,
        channel: ChannelId,
        timeout: Duration,
    ) -> HalResult<YuvImage> {
        if self.stalled.load(Ordering::Acquire) {
            return Err(self.stall(timeout));
        }
        let rx = self.fifo_rx(ChannelKey::new(pipe, channel));
        match rx.recv_timeout(timeout) {
            Ok(image) => {
                self.outstanding_yuv.fetch_add(1, Ordering::AcqRel);
                Ok(image)
            }
            Err(RecvTimeoutError::Timeout) => Err(HalError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(HalError::status("get_yuv_frame", -1)),
        }
    }

    fn release_yuv_frame(&self, pipe: PipeId, channel: ChannelId, frame: &YuvImage) -> HalResult<()> {
        *lock(&self.releases)
            .entry((ChannelKey::new(pipe, channel), frame.seq))
            .or_insert(0) += 1;
        self.outstanding_yuv.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    fn run_isp_once(&self, pipe: PipeId) -> HalResult<()> {
        let mut pipes = lock(&self.pipes);
        let state = pipes
            .get_mut(&pipe)
            .filter(|p| p.open)
            .ok_or(HalError::status("run_isp_once", -1))?;
        state.isp_runs += 1;
        Ok(())
    }
}

impl IspIq for SimHal {
    fn ae_param(&self, pipe: PipeId) -> HalResult<AeParam> {
        Ok(lock(&self.iq).entry(pipe).or_default().ae.clone())
    }

    fn set_ae_param(&self, pipe: PipeId, param: &AeParam) -> HalResult<()> {
        lock(&self.iq).entry(pipe).or_default().ae = param.clone();
        Ok(())
    }

    fn awb_param(&self, pipe: PipeId) -> HalResult<AwbParam> {
        Ok(lock(&self.iq).entry(pipe).or_default().awb.clone())
    }

    fn set_awb_param(&self, pipe: PipeId, param: &AwbParam) -> HalResult<()> {
        lock(&self.iq).entry(pipe).or_default().awb = param.clone();
        Ok(())
    }

    fn ainr_param(&self, pipe: PipeId) -> HalResult<AinrParam> {
        Ok(lock(&self.iq).entry(pipe).or_default().ainr.clone())
    }

    fn set_ainr_param(&self, pipe: PipeId, param: &AinrParam) -> HalResult<()> {
        lock(&self.iq).entry(pipe).or_default().ainr = param.clone();
        Ok(())
    }
}

impl TuningCtrl for SimHal {
    fn stream_init(&self, port: u16) -> HalResult<()> {
        lock(&self.tuning_calls).push(format!("stream_init {port}"));
        self.check_fault("stream_init", 0)
    }

    fn ctrl_init(&self, port: u16) -> HalResult<()> {
        lock(&self.tuning_calls).push(format!("ctrl_init {port}"));
        self.check_fault("ctrl_init", 0)
    }

    fn set_stream_source(&self, pipe: PipeId) -> HalResult<()> {
        lock(&self.tuning_calls).push(format!("set_stream_source {pipe}"));
        Ok(())
    }

    fn ctrl_deinit(&self) -> HalResult<()> {
        lock(&self.tuning_calls).push("ctrl_deinit".to_string());
        Ok(())
    }

    fn stream_deinit(&self) -> HalResult<()> {
        lock(&self.tuning_calls).push("stream_deinit".to_string());
        Ok(())
    }
}

/// Sensor backed by a [`SimHal`] device and its pipes
pub struct SimSensor {
    hal: Arc<SimHal>,
    config: SensorConfig,
    attr: SensorAttr,
    hook: Option<AttrUpdateHook>,
    snapshot: Option<Arc<dyn SnapshotProc>>,
    opened: bool,
}

impl SimSensor {
    pub fn new(hal: Arc<SimHal>, config: SensorConfig) -> Self {
        let attr = SensorAttr::from(&config);
        Self {
            hal,
            config,
            attr,
            hook: None,
            snapshot: None,
            opened: false,
        }
    }

    pub fn with_snapshot_proc(mut self, proc: Arc<dyn SnapshotProc>) -> Self {
        self.snapshot = Some(proc);
        self
    }

    fn dev(&self) -> DevId {
        self.config.dev_id
    }
}

impl Sensor for SimSensor {
    fn kind(&self) -> SensorKind {
        self.config.kind
    }

    fn config(&self) -> &SensorConfig {
        &self.config
    }

    fn register_attr_hook(&mut self, hook: AttrUpdateHook) {
        self.hook = Some(hook);
    }

    fn init(&mut self) -> HalResult<()> {
        self.hal.check_fault("init", self.dev())?;
        self.attr.hdr_mode = self.config.hdr_mode;
        debug!("sim sensor {} init ({:?})", self.config.sns_id, self.attr.hdr_mode);
        Ok(())
    }

    fn open(&mut self) -> HalResult<()> {
        self.hal.check_fault("open", self.dev())?;
        if let Some(hook) = &self.hook {
            if !hook(&self.config, &mut self.attr) {
                return Err(HalError::status("update_sns_attr", -1));
            }
        }
        self.hal.open_device(self.dev(), self.attr.framerate);
        for pipe in &self.config.pipes {
            let channels: Vec<_> = pipe
                .channels
                .iter()
                .map(|c| (c.channel, c.width, c.height))
                .collect();
            self.hal.open_pipe(pipe.pipe_id, &channels);
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> HalResult<()> {
        self.hal.check_fault("close", self.dev())?;
        if !self.opened {
            return Ok(());
        }
        for pipe in &self.config.pipes {
            self.hal.close_pipe(pipe.pipe_id);
        }
        self.hal.close_device(self.dev());
        self.opened = false;
        Ok(())
    }

    fn start_isp_loop(&mut self) -> HalResult<()> {
        self.hal.check_fault("start_isp_loop", self.dev())?;
        self.hal.start_streaming(self.dev())
    }

    fn stop_isp_loop(&mut self) -> HalResult<()> {
        self.hal.check_fault("stop_isp_loop", self.dev())?;
        self.hal.stop_streaming(self.dev());
        Ok(())
    }

    fn change_hdr_mode(&mut self, mode: HdrMode) -> HalResult<()> {
        self.hal.check_fault("change_hdr_mode", self.dev())?;
        self.config.hdr_mode = mode;
        self.attr.hdr_mode = mode;
        Ok(())
    }

    fn attr(&self) -> SensorAttr {
        self.attr.clone()
    }

    fn set_attr(&mut self, attr: SensorAttr) {
        self.attr = attr;
    }

    fn apply_attr(&mut self) -> HalResult<()> {
        self.hal.set_device_rate(self.dev(), self.attr.framerate)
    }

    fn snapshot_proc(&self) -> Option<Arc<dyn SnapshotProc>> {
        self.snapshot.clone()
    }
}

/// Factory producing [`SimSensor`]s on one shared [`SimHal`]
pub struct SimSensorFactory {
    hal: Arc<SimHal>,
    snapshot: Mutex<Option<Arc<dyn SnapshotProc>>>,
    refuse: Mutex<HashSet<u8>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl SimSensorFactory {
    pub fn new(hal: Arc<SimHal>) -> Self {
        Self {
            hal,
            snapshot: Mutex::new(None),
            refuse: Mutex::new(HashSet::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Sensors created from now on use `proc` for snapshots
    pub fn set_snapshot_proc(&self, proc: Arc<dyn SnapshotProc>) {
        *lock(&self.snapshot) = Some(proc);
    }

    /// Refuse to build the sensor with this id
    pub fn refuse(&self, sns_id: u8) {
        lock(&self.refuse).insert(sns_id);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Instances created and not yet destroyed
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }
}

impl SensorFactory for SimSensorFactory {
    fn create(&self, config: &SensorConfig) -> Result<Box<dyn Sensor>, VinError> {
        if lock(&self.refuse).contains(&config.sns_id) {
            return Err(VinError::Creation {
                index: usize::from(config.sns_id),
                reason: format!("sensor {:?} refused", config.kind),
            });
        }
        let mut sensor = SimSensor::new(self.hal.clone(), config.clone());
        if let Some(proc) = lock(&self.snapshot).clone() {
            sensor = sensor.with_snapshot_proc(proc);
        }
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(sensor))
    }

    fn destroy(&self, sensor: Box<dyn Sensor>) {
        debug!("destroy sim sensor {}", sensor.config().sns_id);
        drop(sensor);
        self.destroyed.fetch_add(1, Ordering::AcqRel);
    }
}
