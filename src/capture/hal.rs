//! Narrow contracts onto the vendor capture / ISP SDK.
//!
//! The core never talks to the SDK directly; everything goes through these
//! traits so the pipeline can be driven by real hardware or by
//! [`crate::capture::sim`].

use std::sync::Arc;
use std::time::Duration;

use crate::capture::frame::{FrameSource, HdrMode, RawImage, YuvImage};
use crate::error::HalResult;
use crate::{ChannelId, DevId, PipeId};

/// Capture device / ISP pipe calls used by the frame pipeline
pub trait VinHal: Send + Sync {
    /// Pull one raw sub-frame from a capture device, blocking up to `timeout`
    fn get_raw_frame(&self, dev: DevId, hdr_index: usize, timeout: Duration)
        -> HalResult<RawImage>;

    /// Push raw frames (one per HDR sub-frame) into an ISP pipe
    fn send_raw_frame(
        &self,
        pipe: PipeId,
        source: FrameSource,
        hdr_mode: HdrMode,
        frames: &[RawImage],
    ) -> HalResult<()>;

    fn release_raw_frame(&self, dev: DevId, hdr_index: usize, frame: &RawImage) -> HalResult<()>;

    /// Pull one processed frame from a pipe channel, blocking up to `timeout`
    fn get_yuv_frame(
        &self,
        pipe: PipeId,
        channel: ChannelId,
        timeout: Duration,
    ) -> HalResult<YuvImage>;

    fn release_yuv_frame(&self, pipe: PipeId, channel: ChannelId, frame: &YuvImage)
        -> HalResult<()>;

    /// Run the ISP algorithms once, synchronously
    fn run_isp_once(&self, pipe: PipeId) -> HalResult<()>;
}

/// Auto exposure parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AeParam {
    pub enable: bool,
    pub exposure_us: u32,
    pub again: f32,
    pub dgain: f32,
}

/// Auto white balance parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwbParam {
    pub enable: bool,
    pub r_gain: f32,
    pub b_gain: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AinrModel {
    pub name: String,
    pub path: String,
}

/// AI noise reduction parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AinrParam {
    pub auto_mode: bool,
    pub manual_model: AinrModel,
    /// Models meant for dummy (simulated capture) frames
    pub dummy_models: Vec<AinrModel>,
    pub auto_models: Vec<AinrModel>,
}

/// Image quality parameter access, used by the snapshot procedure
pub trait IspIq: Send + Sync {
    fn ae_param(&self, pipe: PipeId) -> HalResult<AeParam>;
    fn set_ae_param(&self, pipe: PipeId, param: &AeParam) -> HalResult<()>;
    fn awb_param(&self, pipe: PipeId) -> HalResult<AwbParam>;
    fn set_awb_param(&self, pipe: PipeId, param: &AwbParam) -> HalResult<()>;
    fn ainr_param(&self, pipe: PipeId) -> HalResult<AinrParam>;
    fn set_ainr_param(&self, pipe: PipeId, param: &AinrParam) -> HalResult<()>;
}

/// Debug streaming / live tuning control
pub trait TuningCtrl: Send + Sync {
    fn stream_init(&self, port: u16) -> HalResult<()>;
    fn ctrl_init(&self, port: u16) -> HalResult<()>;
    fn set_stream_source(&self, pipe: PipeId) -> HalResult<()>;
    fn ctrl_deinit(&self) -> HalResult<()>;
    fn stream_deinit(&self) -> HalResult<()>;
}

/// Hardware collaborators injected into the sensor manager
#[derive(Clone)]
pub struct Platform {
    pub vin: Arc<dyn VinHal>,
    pub iq: Arc<dyn IspIq>,
    pub tuning: Arc<dyn TuningCtrl>,
}

impl Platform {
    pub fn new(vin: Arc<dyn VinHal>, iq: Arc<dyn IspIq>, tuning: Arc<dyn TuningCtrl>) -> Self {
        Self { vin, iq, tuning }
    }

    /// One object serving all three roles, e.g. the simulated SoC
    pub fn from_single<T>(hw: Arc<T>) -> Self
    where
        T: VinHal + IspIq + TuningCtrl + 'static,
    {
        Self {
            vin: hw.clone(),
            iq: hw.clone(),
            tuning: hw,
        }
    }
}
