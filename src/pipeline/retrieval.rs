//! Per (pipe, channel) processed frame retrieval

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::capture::frame::YuvFrameHandle;
use crate::pipeline::dispatch::SensorGate;
use crate::pipeline::hub::FrameHub;
use crate::pipeline::worker::StopToken;
use crate::{ChannelKey, PipelineConfig};

/// What one retrieval iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    Paused,
    Failed,
    Published,
    /// In-flight queue full, frame went straight back
    Dropped,
}

pub struct YuvRetriever {
    key: ChannelKey,
    multiplex: bool,
    gate: Arc<SensorGate>,
    hub: Arc<FrameHub>,
    timeout: Duration,
    poll_interval: Duration,
}

impl YuvRetriever {
    pub fn new(
        key: ChannelKey,
        multiplex: bool,
        gate: Arc<SensorGate>,
        hub: Arc<FrameHub>,
        cfg: &PipelineConfig,
    ) -> Self {
        Self {
            key,
            multiplex,
            gate,
            hub,
            timeout: cfg.yuv_timeout(),
            poll_interval: cfg.poll_interval(),
        }
    }

    pub fn run(self, stop: StopToken) {
        let span = info_span!("yuv_get", pipe = self.key.pipe, chn = self.key.channel);
        let _guard = span.enter();
        info!("+++ multiplex: {}", self.multiplex);

        let mut published = 0u64;
        while !stop.is_stopped() {
            if self.step(&stop) == Fetch::Published {
                published += 1;
            }
        }
        info!("--- after {} frames", published);
    }

    pub fn step(&self, stop: &StopToken) -> Fetch {
        if !self.gate.is_accepting() {
            thread::sleep(self.poll_interval);
            return Fetch::Paused;
        }

        let hal = self.hub.hal();
        let image = match hal.get_yuv_frame(self.key.pipe, self.key.channel, self.timeout) {
            Ok(image) => image,
            Err(e) => {
                if !stop.is_stopped() {
                    if e.is_timeout() {
                        debug!("{} no frame within {:?}", self.key, self.timeout);
                    } else {
                        warn!(
                            "{} get yuv frame failed: {}, unreleased buffer={}",
                            self.key,
                            e,
                            self.hub.in_flight(self.key)
                        );
                    }
                }
                if !e.is_timeout() {
                    // A failing call returns at once; don't spin on it
                    thread::sleep(self.poll_interval);
                }
                return Fetch::Failed;
            }
        };

        debug!(
            "{} seq {}, {}x{}, pts {:?}, addr {:#x}",
            self.key, image.seq, image.width, image.height, image.pts, image.phy_addr
        );
        let handle = YuvFrameHandle::new(hal.clone(), image);
        match self.hub.publish(handle, self.multiplex) {
            Ok(()) => Fetch::Published,
            Err(e) => {
                warn!("{}", e);
                Fetch::Dropped
            }
        }
    }
}
