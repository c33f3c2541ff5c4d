use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capture::hal::VinHal;
use crate::{ChannelId, ChannelKey, DevId, PipeId};

/// Number of exposure sub-frames captured per logical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HdrMode {
    #[default]
    Linear,
    Hdr2,
    Hdr3,
    Hdr4,
}

impl HdrMode {
    pub fn frame_count(self) -> usize {
        match self {
            HdrMode::Linear => 1,
            HdrMode::Hdr2 => 2,
            HdrMode::Hdr3 => 3,
            HdrMode::Hdr4 => 4,
        }
    }

    pub fn from_frame_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(HdrMode::Linear),
            2 => Some(HdrMode::Hdr2),
            3 => Some(HdrMode::Hdr3),
            4 => Some(HdrMode::Hdr4),
            _ => None,
        }
    }
}

/// Where a raw frame pushed into a pipe came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// Image front end of the capture device
    Ife,
    /// Software supplied (replayed) frame
    User,
}

/// Raw (bayer) frame descriptor pulled from a capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub dev: DevId,
    pub hdr_index: usize,
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub pts: Duration,
    pub phy_addr: u64,
    /// Pipe tag stamped by the device when flash scheduling is active
    pub pipe_tag: PipeId,
}

/// Processed frame descriptor pulled from an ISP pipe channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YuvImage {
    pub pipe: PipeId,
    pub channel: ChannelId,
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pts: Duration,
    pub phy_addr: u64,
    pub vir_addr: u64,
    pub data: Bytes,
}

/// Owned hardware YUV buffer. Dropping it hands the buffer back to the pipe.
pub struct YuvFrameHandle {
    image: YuvImage,
    hal: Arc<dyn VinHal>,
}

impl YuvFrameHandle {
    pub fn new(hal: Arc<dyn VinHal>, image: YuvImage) -> Self {
        Self { image, hal }
    }

    pub fn image(&self) -> &YuvImage {
        &self.image
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.image.pipe, self.image.channel)
    }
}

impl Drop for YuvFrameHandle {
    fn drop(&mut self) {
        let img = &self.image;
        match self
            .hal
            .release_yuv_frame(img.pipe, img.channel, img)
        {
            Ok(()) => debug!(
                "[{}][{}] release yuv frame, seq:{}, addr:{:#x}",
                img.pipe, img.channel, img.seq, img.phy_addr
            ),
            Err(e) => warn!(
                "[{}][{}] release yuv frame seq {} failed: {}",
                img.pipe, img.channel, img.seq, e
            ),
        }
    }
}

impl fmt::Debug for YuvFrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YuvFrameHandle")
            .field("pipe", &self.image.pipe)
            .field("channel", &self.image.channel)
            .field("seq", &self.image.seq)
            .finish()
    }
}

/// Raw frames pulled from one device for one tick, one per HDR sub-frame.
///
/// Every frame that was successfully pulled is released back to the device
/// when the set is dropped, regardless of what happened to the dispatch.
pub struct RawFrameSet {
    dev: DevId,
    frames: Vec<RawImage>,
    hal: Arc<dyn VinHal>,
}

impl RawFrameSet {
    /// Pull `hdr.frame_count()` sub-frames, stopping at the first failure.
    /// The error comes back with whatever arrived before it, so one tick on
    /// stalled hardware waits out a single timeout.
    pub fn pull(
        hal: Arc<dyn VinHal>,
        dev: DevId,
        hdr: HdrMode,
        timeout: Duration,
    ) -> (Self, Option<crate::error::HalError>) {
        let mut frames = Vec::with_capacity(hdr.frame_count());
        let mut err = None;
        for index in 0..hdr.frame_count() {
            match hal.get_raw_frame(dev, index, timeout) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        (Self { dev, frames, hal }, err)
    }

    pub fn frames(&self) -> &[RawImage] {
        &self.frames
    }

    pub fn first(&self) -> Option<&RawImage> {
        self.frames.first()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Drop for RawFrameSet {
    fn drop(&mut self) {
        for frame in &self.frames {
            if let Err(e) = self.hal.release_raw_frame(self.dev, frame.hdr_index, frame) {
                warn!("[{}] release dev frame failed: {}", self.dev, e);
            }
        }
    }
}

/// Metadata shared by every holder of a [`FrameBuffer`]
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub pipe: PipeId,
    pub channel: ChannelId,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pts: Duration,
    pub phy_addr: u64,
    pub vir_addr: u64,
}

impl From<&YuvImage> for FrameMetadata {
    fn from(img: &YuvImage) -> Self {
        Self {
            pipe: img.pipe,
            channel: img.channel,
            sequence: img.seq,
            width: img.width,
            height: img.height,
            stride: img.stride,
            pts: img.pts,
            phy_addr: img.phy_addr,
            vir_addr: img.vir_addr,
        }
    }
}

/// Single entry point for handing a frame back once a holder is done with it
pub trait FrameRelease: Send + Sync {
    fn release_frame(&self, frame: &FrameBuffer);
}

#[derive(Debug)]
pub(crate) struct FrameShared {
    pub(crate) meta: FrameMetadata,
    pub(crate) data: Bytes,
    pub(crate) multiplex: bool,
    refs: AtomicU32,
}

impl FrameShared {
    /// Decrement the reference count, saturating at zero, and return the new count
    pub(crate) fn dec_ref(&self) -> u32 {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

/// Frame lent out to observers.
///
/// Cloning is cheap and does not touch the reference count. Observers that
/// keep a multiplexed frame past `on_frame` call [`FrameBuffer::add_ref`] and
/// later one [`FrameBuffer::release`] per reference; non-multiplexed frames go
/// back to hardware on the first release.
#[derive(Clone)]
pub struct FrameBuffer {
    shared: Arc<FrameShared>,
    releaser: Weak<dyn FrameRelease>,
}

impl FrameBuffer {
    pub(crate) fn new(
        image: &YuvImage,
        multiplex: bool,
        releaser: Weak<dyn FrameRelease>,
    ) -> Self {
        Self {
            shared: Arc::new(FrameShared {
                meta: FrameMetadata::from(image),
                data: image.data.clone(),
                multiplex,
                refs: AtomicU32::new(0),
            }),
            releaser,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<FrameShared> {
        &self.shared
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.shared.meta
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.shared.meta.pipe, self.shared.meta.channel)
    }

    pub fn sequence(&self) -> u64 {
        self.shared.meta.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.shared.data
    }

    pub fn is_multiplex(&self) -> bool {
        self.shared.multiplex
    }

    pub fn ref_count(&self) -> u32 {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Take one more reference on a multiplexed frame
    pub fn add_ref(&self) -> u32 {
        self.shared.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Give this holder's reference back. A no-op once the frame has already
    /// returned to hardware.
    pub fn release(&self) {
        if let Some(releaser) = self.releaser.upgrade() {
            releaser.release_frame(self);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pipe", &self.shared.meta.pipe)
            .field("channel", &self.shared.meta.channel)
            .field("sequence", &self.shared.meta.sequence)
            .field("multiplex", &self.shared.multiplex)
            .field("refs", &self.ref_count())
            .finish()
    }
}
