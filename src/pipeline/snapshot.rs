//! Still capture on a snapshot pipe with AE/AWB frozen

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::capture::frame::{FrameSource, HdrMode, RawImage, YuvFrameHandle};
use crate::capture::hal::{AinrModel, AinrParam, IspIq, VinHal};
use crate::error::{HalError, Result};
use crate::{ChannelId, PipeId};

/// Hardware access available to a snapshot procedure
#[derive(Clone)]
pub struct SnapshotContext {
    pub hal: Arc<dyn VinHal>,
    pub iq: Arc<dyn IspIq>,
    pub timeout: Duration,
}

/// One snapshot to take from the raw frames of the current tick
#[derive(Debug)]
pub struct SnapshotRequest<'a> {
    pub pipe: PipeId,
    pub channel: ChannelId,
    /// Pipe whose AE/AWB state the still is exposed with
    pub preview_pipe: PipeId,
    pub hdr_mode: HdrMode,
    pub frames: &'a [RawImage],
    pub dummy: bool,
}

pub trait SnapshotProc: Send + Sync {
    fn capture(&self, ctx: &SnapshotContext, req: &SnapshotRequest<'_>) -> Result<()>;
}

/// Built-in two-pass procedure.
///
/// AE and AWB are copied from the preview pipe and disabled on the snapshot
/// pipe, then the raw frames are pushed through the ISP twice. The YUV output
/// of the first pass only flushes the pipe and is discarded; the second pass
/// output is collected by [`crate::pipeline::FrameHub::notify_snapshot`].
#[derive(Debug, Default, Clone, Copy)]
pub struct IqSnapshot;

fn logged<T>(pipe: PipeId, res: std::result::Result<T, HalError>) -> std::result::Result<T, HalError> {
    res.map_err(|e| {
        error!("[{}] snapshot: {}", pipe, e);
        e
    })
}

impl IqSnapshot {
    fn freeze_3a(ctx: &SnapshotContext, req: &SnapshotRequest<'_>) -> Result<()> {
        let mut ae = logged(req.pipe, ctx.iq.ae_param(req.preview_pipe))?;
        ae.enable = false;
        logged(req.pipe, ctx.iq.set_ae_param(req.pipe, &ae))?;

        let mut awb = logged(req.pipe, ctx.iq.awb_param(req.preview_pipe))?;
        awb.enable = false;
        logged(req.pipe, ctx.iq.set_awb_param(req.pipe, &awb))?;
        Ok(())
    }

    /// Force AINR to manual with the first model of the chosen table
    fn pin_denoise_model(ctx: &SnapshotContext, pipe: PipeId, pick: fn(&AinrParam) -> Option<&AinrModel>) {
        let mut param = match ctx.iq.ainr_param(pipe) {
            Ok(p) => p,
            Err(e) => {
                warn!("[{}] get ainr param failed: {}", pipe, e);
                return;
            }
        };
        param.auto_mode = false;
        if let Some(model) = pick(&param).cloned() {
            param.manual_model = model;
        }
        if let Err(e) = ctx.iq.set_ainr_param(pipe, &param) {
            warn!("[{}] set ainr param failed: {}", pipe, e);
        }
    }

    fn run_pass(ctx: &SnapshotContext, req: &SnapshotRequest<'_>) -> Result<()> {
        logged(req.pipe, ctx.hal.run_isp_once(req.pipe))?;
        logged(
            req.pipe,
            ctx.hal
                .send_raw_frame(req.pipe, FrameSource::Ife, req.hdr_mode, req.frames),
        )?;
        debug!("send snapshot raw to pipe {}", req.pipe);
        Ok(())
    }
}

impl SnapshotProc for IqSnapshot {
    fn capture(&self, ctx: &SnapshotContext, req: &SnapshotRequest<'_>) -> Result<()> {
        Self::freeze_3a(ctx, req)?;

        if req.dummy {
            Self::pin_denoise_model(ctx, req.pipe, |p| p.dummy_models.first());
        }
        Self::run_pass(ctx, req)?;

        let first = logged(
            req.pipe,
            ctx.hal.get_yuv_frame(req.pipe, req.channel, ctx.timeout),
        )?;
        drop(YuvFrameHandle::new(ctx.hal.clone(), first));

        if req.dummy {
            Self::pin_denoise_model(ctx, req.pipe, |p| p.auto_models.first());
        }
        Self::run_pass(ctx, req)
    }
}
