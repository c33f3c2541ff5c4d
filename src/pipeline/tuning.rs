//! Live tuning / debug streaming control

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::capture::hal::TuningCtrl;
use crate::capture::sensor::SensorConfig;

/// Starts and stops tuning control for the pipes that ask for it.
///
/// Failures are logged and never stop the caller; tuning is a debugging aid.
pub struct TuningSession {
    ctrl: Arc<dyn TuningCtrl>,
    stream_port: u16,
    active: bool,
}

impl TuningSession {
    pub fn new(ctrl: Arc<dyn TuningCtrl>, stream_port: u16) -> Self {
        Self {
            ctrl,
            stream_port,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns whether tuning is running. A failed stream or ctrl init leaves
    /// it off.
    pub fn start<'a>(&mut self, sensors: impl IntoIterator<Item = &'a SensorConfig>) -> bool {
        for sensor in sensors {
            for pipe in sensor.pipes.iter().filter(|p| p.tuning) {
                if !self.active {
                    if let Err(e) = self.ctrl.stream_init(self.stream_port) {
                        error!("tuning stream init on port {} failed: {}", self.stream_port, e);
                        return false;
                    }
                    if let Err(e) = self.ctrl.ctrl_init(pipe.tuning_port) {
                        error!("tuning ctrl init on port {} failed: {}", pipe.tuning_port, e);
                        if let Err(e) = self.ctrl.stream_deinit() {
                            error!("tuning stream deinit failed: {}", e);
                        }
                        return false;
                    }
                    info!(
                        "tuning started, stream port {}, ctrl port {}",
                        self.stream_port, pipe.tuning_port
                    );
                    self.active = true;
                }
                if pipe.channels.iter().any(|c| c.compressed) {
                    warn!("pipe {} has compressed output, tuning stream may be unusable", pipe.pipe_id);
                }
                if let Err(e) = self.ctrl.set_stream_source(pipe.pipe_id) {
                    error!("tuning stream source pipe {} failed: {}", pipe.pipe_id, e);
                }
            }
        }
        self.active
    }

    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = self.ctrl.ctrl_deinit() {
            error!("tuning ctrl deinit failed: {}", e);
        }
        if let Err(e) = self.ctrl.stream_deinit() {
            error!("tuning stream deinit failed: {}", e);
        }
        self.active = false;
        info!("tuning stopped");
    }
}
