//! Per-device raw frame dispatch.
//!
//! One [`RawDispatcher`] runs per capture device. Each tick it pulls one raw
//! frame per HDR sub-frame, feeds at most one ISP pipe (or runs a snapshot)
//! and hands the raw frames back to the device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::Counter;
use tracing::{debug, error, info, info_span, trace, warn};

use crate::capture::frame::{FrameSource, HdrMode, RawFrameSet, RawImage};
use crate::capture::hal::IspIq;
use crate::capture::sensor::SensorConfig;
use crate::pipeline::framerate::{first_due, plan_dividers, FrameRate, FramerateDivider};
use crate::pipeline::hub::FrameHub;
use crate::pipeline::snapshot::{IqSnapshot, SnapshotContext, SnapshotProc, SnapshotRequest};
use crate::pipeline::worker::StopToken;
use crate::{ChannelKey, DevId, PipeId, PipelineConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct PipeRoute {
    pub pipe: PipeId,
    pub rate: FrameRate,
    pub snapshot: bool,
    pub dummy: bool,
}

/// Everything a dispatcher needs to know about its sensor. Replaced as a
/// whole when the sensor is reconfigured.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub sns_index: usize,
    pub dev: DevId,
    pub device_rate: FrameRate,
    pub hdr_mode: HdrMode,
    pub flash: bool,
    /// AE/AWB reference for snapshots
    pub preview_pipe: PipeId,
    pub pipes: Vec<PipeRoute>,
}

impl DispatchPlan {
    pub fn from_config(sns_index: usize, cfg: &SensorConfig) -> Self {
        Self {
            sns_index,
            dev: cfg.dev_id,
            device_rate: FrameRate::from_fps(cfg.framerate),
            hdr_mode: cfg.hdr_mode,
            flash: cfg.enable_flash,
            preview_pipe: cfg.pipes.first().map_or(0, |p| p.pipe_id),
            pipes: cfg
                .pipes
                .iter()
                .map(|p| PipeRoute {
                    pipe: p.pipe_id,
                    rate: FrameRate::from_fps(p.framerate),
                    snapshot: p.snapshot,
                    dummy: p.dummy,
                })
                .collect(),
        }
    }

    /// Dividers in pipe order, each seeded with what the earlier pipes left
    pub fn dividers(&self) -> Vec<FramerateDivider> {
        plan_dividers(self.device_rate, self.pipes.iter().map(|p| p.rate))
    }

    pub fn route_for_tag(&self, tag: PipeId) -> Option<&PipeRoute> {
        self.pipes.iter().find(|p| p.pipe == tag)
    }
}

/// Per-sensor switch shared by the manager and the sensor's workers
pub struct SensorGate {
    accepting: AtomicBool,
    plan: ArcSwap<DispatchPlan>,
}

impl SensorGate {
    pub fn new(plan: DispatchPlan) -> Self {
        Self {
            accepting: AtomicBool::new(true),
            plan: ArcSwap::from_pointee(plan),
        }
    }

    /// Workers of this sensor poll instead of touching hardware until resumed
    pub fn pause(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn plan(&self) -> Arc<DispatchPlan> {
        self.plan.load_full()
    }

    /// Publish a modified plan; dispatchers pick it up at their next tick
    pub fn update(&self, f: impl Fn(&DispatchPlan) -> DispatchPlan) {
        self.plan.rcu(|plan| f(plan));
    }
}

/// Counter handles for one device and its pipes
struct DispatchMetrics {
    errors: Counter,
    dispatched: HashMap<PipeId, Counter>,
    snapshots: HashMap<PipeId, Counter>,
}

impl DispatchMetrics {
    fn new(plan: &DispatchPlan) -> Self {
        let dev = plan.dev.to_string();
        let mut dispatched = HashMap::new();
        let mut snapshots = HashMap::new();
        for route in &plan.pipes {
            let pipe = route.pipe.to_string();
            dispatched.insert(
                route.pipe,
                metrics::counter!("vinmux_raw_frames_dispatched_total", "dev" => dev.clone(), "pipe" => pipe.clone()),
            );
            snapshots.insert(route.pipe, metrics::counter!("vinmux_snapshots_total", "pipe" => pipe));
        }
        Self {
            errors: metrics::counter!("vinmux_raw_dispatch_errors_total", "dev" => dev),
            dispatched,
            snapshots,
        }
    }
}

/// What one dispatch tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Paused,
    PullFailed,
    /// No pipe was due
    Idle,
    Sent(PipeId),
    Snapshot(PipeId),
    Failed(PipeId),
}

pub struct RawDispatcher {
    gate: Arc<SensorGate>,
    hub: Arc<FrameHub>,
    snapshot_ctx: SnapshotContext,
    custom_snapshot: Option<Arc<dyn SnapshotProc>>,
    raw_timeout: Duration,
    poll_interval: Duration,
    flash_tag: PipeId,
    plan: Arc<DispatchPlan>,
    dividers: Vec<FramerateDivider>,
    metrics: DispatchMetrics,
    seq: u64,
}

impl RawDispatcher {
    pub fn new(
        gate: Arc<SensorGate>,
        hub: Arc<FrameHub>,
        iq: Arc<dyn IspIq>,
        cfg: &PipelineConfig,
    ) -> Self {
        let plan = gate.plan();
        let dividers = plan.dividers();
        let mut remain = plan.device_rate;
        for route in &plan.pipes {
            info!(
                "framerate control => [dev{}, pipe{}]: {} => {}",
                plan.dev, route.pipe, remain, route.rate
            );
            remain = remain.saturating_sub(route.rate);
        }
        let snapshot_ctx = SnapshotContext {
            hal: hub.hal().clone(),
            iq,
            timeout: cfg.snapshot_timeout(),
        };
        Self {
            gate,
            hub,
            snapshot_ctx,
            custom_snapshot: None,
            raw_timeout: cfg.raw_timeout(),
            poll_interval: cfg.poll_interval(),
            flash_tag: cfg.flash_snapshot_tag,
            metrics: DispatchMetrics::new(&plan),
            plan,
            dividers,
            seq: 0,
        }
    }

    /// Sensor specific snapshot procedure replacing [`IqSnapshot`]
    pub fn with_snapshot_proc(mut self, proc: Option<Arc<dyn SnapshotProc>>) -> Self {
        self.custom_snapshot = proc;
        self
    }

    /// Frames dispatched so far
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn run(mut self, stop: StopToken) {
        let span = info_span!("raw_dispatch", dev = self.plan.dev);
        let _guard = span.enter();
        info!("+++ {} pipes, {:?}", self.plan.pipes.len(), self.plan.hdr_mode);

        while !stop.is_stopped() {
            self.step(&stop);
        }
        info!("--- after {} frames", self.seq);
    }

    /// One loop iteration
    pub fn step(&mut self, stop: &StopToken) -> Tick {
        if !self.gate.is_accepting() {
            thread::sleep(self.poll_interval);
            return Tick::Paused;
        }
        self.reload_plan();
        let plan = self.plan.clone();

        let (frames, err) =
            RawFrameSet::pull(self.hub.hal().clone(), plan.dev, plan.hdr_mode, self.raw_timeout);
        if let Some(e) = err {
            if !stop.is_stopped() {
                warn!("dev[{}] get raw frame failed: {}", plan.dev, e);
            }
            self.metrics.errors.increment(1);
            return Tick::PullFailed;
        }

        let tick = match self.pick_route(&plan, frames.first()) {
            None => Tick::Idle,
            Some((route, true)) => self.snapshot(&plan, route, frames.frames()),
            Some((route, false)) => self.send(&plan, route, frames.frames()),
        };
        drop(frames);
        trace!("[{}] release dev frames, tick {:?}", self.seq, tick);

        self.seq = self.seq.wrapping_add(1);
        tick
    }

    fn reload_plan(&mut self) {
        let current = self.gate.plan();
        if !Arc::ptr_eq(&current, &self.plan) {
            debug!(
                "dev[{}] plan changed: {} fps, {:?}",
                current.dev, current.device_rate, current.hdr_mode
            );
            self.dividers = current.dividers();
            self.metrics = DispatchMetrics::new(&current);
            self.plan = current;
        }
    }

    /// Pipe fed this tick and whether it takes the snapshot path
    fn pick_route<'p>(
        &mut self,
        plan: &'p DispatchPlan,
        first: Option<&RawImage>,
    ) -> Option<(&'p PipeRoute, bool)> {
        if plan.flash {
            // The device stamps which pipe each exposure belongs to
            let tag = first?.pipe_tag;
            let route = plan.route_for_tag(tag);
            if route.is_none() {
                debug!("dev[{}] no pipe for tag {}", plan.dev, tag);
            }
            route.map(|r| (r, tag == self.flash_tag))
        } else {
            first_due(&mut self.dividers)
                .and_then(|i| plan.pipes.get(i))
                .map(|r| (r, r.snapshot))
        }
    }

    fn send(&self, plan: &DispatchPlan, route: &PipeRoute, frames: &[RawImage]) -> Tick {
        match self
            .hub
            .hal()
            .send_raw_frame(route.pipe, FrameSource::Ife, plan.hdr_mode, frames)
        {
            Ok(()) => {
                if let Some(counter) = self.metrics.dispatched.get(&route.pipe) {
                    counter.increment(1);
                }
                Tick::Sent(route.pipe)
            }
            Err(e) => {
                warn!("dev:{}, pipe[{}] send raw frame failed: {}", plan.dev, route.pipe, e);
                self.metrics.errors.increment(1);
                Tick::Failed(route.pipe)
            }
        }
    }

    fn snapshot(&self, plan: &DispatchPlan, route: &PipeRoute, frames: &[RawImage]) -> Tick {
        let req = SnapshotRequest {
            pipe: route.pipe,
            channel: 0,
            preview_pipe: plan.preview_pipe,
            hdr_mode: plan.hdr_mode,
            frames,
            dummy: route.dummy,
        };
        let result = match &self.custom_snapshot {
            Some(proc) => proc.capture(&self.snapshot_ctx, &req),
            None => IqSnapshot.capture(&self.snapshot_ctx, &req),
        };
        if let Err(e) = result {
            error!("[{}] snapshot process failed: {}", route.pipe, e);
            return Tick::Failed(route.pipe);
        }

        let key = ChannelKey::new(route.pipe, 0);
        if let Err(e) = self.hub.notify_snapshot(key, self.snapshot_ctx.timeout) {
            error!("[{}] get snapshot frame failed: {}", route.pipe, e);
            return Tick::Failed(route.pipe);
        }
        if let Some(counter) = self.metrics.snapshots.get(&route.pipe) {
            counter.increment(1);
        }
        Tick::Snapshot(route.pipe)
    }
}
