//! Observer registration and frame fan-out

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::capture::frame::FrameBuffer;
use crate::{ChannelKey, PipeId};

/// Transfer attributes offered to an observer when it registers
#[derive(Debug, Clone, PartialEq)]
pub struct TransAttr {
    pub group: PipeId,
    pub channel: u8,
    pub framerate: f32,
    pub width: u32,
    pub height: u32,
    pub compressed: bool,
    pub link: bool,
    pub sensor_index: usize,
}

/// Downstream consumer of processed frames (encoder, detector, ...)
pub trait Observer: Send + Sync {
    /// Accept or decline a registration for `key`
    fn on_register(&self, key: ChannelKey, attr: &TransAttr) -> bool;

    /// Called synchronously on the retrieval thread. The observer must
    /// eventually call [`FrameBuffer::release`] (once per `add_ref` for
    /// multiplexed frames).
    fn on_frame(&self, key: ChannelKey, frame: &FrameBuffer);

    fn name(&self) -> &str {
        "observer"
    }
}

type ObserverList = Arc<[Arc<dyn Observer>]>;

fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Per (pipe, channel) observer lists.
///
/// Readers (retrieval threads) take a snapshot without locking; add/remove
/// publish a new copy of the table.
pub struct ObserverRegistry {
    table: ArcSwap<HashMap<ChannelKey, ObserverList>>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn add(&self, key: ChannelKey, observer: Arc<dyn Observer>) {
        self.table.rcu(|table| {
            let mut table = HashMap::clone(table);
            let mut list: Vec<_> = table
                .get(&key)
                .map(|l| l.to_vec())
                .unwrap_or_default();
            list.push(observer.clone());
            table.insert(key, list.into());
            table
        });
        debug!("{} observer {} registered", key, observer.name());
    }

    /// Remove the first registration of `observer` on `key`
    pub fn remove(&self, key: ChannelKey, observer: &Arc<dyn Observer>) -> bool {
        let mut removed = false;
        self.table.rcu(|table| {
            removed = false;
            let mut table = HashMap::clone(table);
            if let Some(list) = table.get(&key) {
                if let Some(pos) = list.iter().position(|o| same_observer(o, observer)) {
                    let mut list = list.to_vec();
                    list.remove(pos);
                    removed = true;
                    if list.is_empty() {
                        table.remove(&key);
                    } else {
                        table.insert(key, list.into());
                    }
                }
            }
            table
        });
        removed
    }

    pub fn observers(&self, key: ChannelKey) -> Vec<Arc<dyn Observer>> {
        self.table
            .load()
            .get(&key)
            .map(|l| l.to_vec())
            .unwrap_or_default()
    }

    pub fn count(&self, key: ChannelKey) -> usize {
        self.table.load().get(&key).map_or(0, |l| l.len())
    }

    /// Hand `frame` to every observer of `key` in registration order.
    /// Returns `false` when nobody is registered; the caller owns the frame then.
    pub fn notify_all(&self, key: ChannelKey, frame: &FrameBuffer) -> bool {
        let list = self.table.load().get(&key).cloned();
        match list {
            Some(list) if !list.is_empty() => {
                for observer in list.iter() {
                    observer.on_frame(key, frame);
                }
                true
            }
            _ => false,
        }
    }
}

/// Observer that forwards frames to a bounded channel.
///
/// Multiplexed frames get a reference taken on the receiver's behalf. When the
/// channel is full the frame is released immediately instead of blocking the
/// retrieval thread.
pub struct ChannelObserver {
    name: String,
    accept: Option<ChannelKey>,
    tx: Sender<FrameBuffer>,
}

impl ChannelObserver {
    /// `accept` limits registration to one key; `None` accepts any
    pub fn bounded(
        name: impl Into<String>,
        accept: Option<ChannelKey>,
        capacity: usize,
    ) -> (Arc<Self>, Receiver<FrameBuffer>) {
        let (tx, rx) = flume::bounded(capacity);
        let observer = Arc::new(Self {
            name: name.into(),
            accept,
            tx,
        });
        (observer, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_register(&self, key: ChannelKey, _attr: &TransAttr) -> bool {
        self.accept.map_or(true, |k| k == key)
    }

    fn on_frame(&self, key: ChannelKey, frame: &FrameBuffer) {
        if frame.is_multiplex() {
            frame.add_ref();
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                warn!("{} {} consumer lagging, frame {} returned", self.name, key, frame.sequence());
                frame.release();
            }
            Err(TrySendError::Disconnected(frame)) => frame.release(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
