//! Shared frame-flow core used by both worker kinds and the manager

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{Counter, Gauge, Label};
use tracing::{debug, warn};

use crate::capture::frame::{FrameBuffer, FrameRelease, YuvFrameHandle};
use crate::capture::hal::VinHal;
use crate::error::{Result, VinError};
use crate::pipeline::observer::ObserverRegistry;
use crate::pipeline::queue::{FrameQueue, QueueEntry, QueueStats, Released};
use crate::ChannelKey;

/// Metric handles of one (pipe, channel), resolved when its queue is created
struct ChannelMetrics {
    frames: Counter,
    dropped: Counter,
    in_flight: Gauge,
}

impl ChannelMetrics {
    fn new(key: ChannelKey) -> Self {
        let labels = vec![
            Label::new("pipe", key.pipe.to_string()),
            Label::new("chn", key.channel.to_string()),
        ];
        Self {
            frames: metrics::counter!("vinmux_yuv_frames_total", labels.clone()),
            dropped: metrics::counter!("vinmux_yuv_frames_dropped_total", labels.clone()),
            in_flight: metrics::gauge!("vinmux_frames_in_flight", labels),
        }
    }
}

struct Channel {
    queue: FrameQueue,
    metrics: ChannelMetrics,
}

impl Channel {
    fn new(key: ChannelKey, depth: usize) -> Self {
        Self {
            queue: FrameQueue::new(key, depth),
            metrics: ChannelMetrics::new(key),
        }
    }
}

/// In-flight queues, observer lists and the hardware release path
pub struct FrameHub {
    hal: Arc<dyn VinHal>,
    depth: usize,
    channels: ArcSwap<HashMap<ChannelKey, Arc<Channel>>>,
    registry: ObserverRegistry,
}

impl FrameHub {
    pub fn new(hal: Arc<dyn VinHal>, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            hal,
            depth,
            channels: ArcSwap::from_pointee(HashMap::new()),
            registry: ObserverRegistry::new(),
        })
    }

    pub fn hal(&self) -> &Arc<dyn VinHal> {
        &self.hal
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    /// Make sure every key has a queue; existing queues are kept
    pub fn ensure_queues(&self, keys: impl IntoIterator<Item = ChannelKey>) {
        let keys: Vec<_> = keys.into_iter().collect();
        if keys.iter().all(|key| self.channels.load().contains_key(key)) {
            return;
        }
        self.channels.rcu(|channels| {
            let mut channels = HashMap::clone(channels);
            for key in &keys {
                channels
                    .entry(*key)
                    .or_insert_with(|| Arc::new(Channel::new(*key, self.depth)));
            }
            channels
        });
    }

    fn channel(&self, key: ChannelKey) -> Arc<Channel> {
        if let Some(channel) = self.channels.load().get(&key) {
            return channel.clone();
        }
        self.ensure_queues([key]);
        self.channels
            .load()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Arc::new(Channel::new(key, self.depth)))
    }

    /// Queue a freshly retrieved frame and fan it out.
    ///
    /// On overflow the new frame goes straight back to hardware and
    /// [`VinError::QueueOverflow`] is returned; queued frames are never evicted.
    pub fn publish(self: &Arc<Self>, handle: YuvFrameHandle, multiplex: bool) -> Result<()> {
        let key = handle.key();
        let releaser: Weak<dyn FrameRelease> = Arc::downgrade(self) as Weak<dyn FrameRelease>;
        let frame = FrameBuffer::new(handle.image(), multiplex, releaser);
        let channel = self.channel(key);

        let entry = QueueEntry {
            frame: frame.shared().clone(),
            handle,
        };
        match channel.queue.push(entry) {
            Ok(in_flight) => channel.metrics.in_flight.set(in_flight as f64),
            Err(rejected) => {
                drop(rejected);
                channel.metrics.dropped.increment(1);
                return Err(VinError::QueueOverflow {
                    pipe: key.pipe,
                    channel: key.channel,
                    depth: channel.queue.depth(),
                });
            }
        }
        channel.metrics.frames.increment(1);

        // Hold a reference across the fan-out so an early release by one
        // observer cannot return the buffer before the others got it
        if multiplex {
            frame.add_ref();
        }
        let notified = self.registry.notify_all(key, &frame);
        if multiplex || !notified {
            self.release(&frame);
        }
        Ok(())
    }

    /// Release protocol entry point, see [`FrameQueue`]
    pub fn release(&self, frame: &FrameBuffer) {
        let key = frame.key();
        let Some(channel) = self.channels.load().get(&key).cloned() else {
            return;
        };
        match channel.queue.release(frame.sequence()) {
            Released::Returned(entry) => {
                drop(entry);
                channel.metrics.in_flight.set(channel.queue.len() as f64);
            }
            Released::StillReferenced(refs) => {
                debug!("{} seq {} still held by {} observers", key, frame.sequence(), refs)
            }
            Released::NotFound => {
                debug!("{} seq {} already released", key, frame.sequence())
            }
        }
    }

    /// Pull the frame a finished snapshot produced and publish it, never
    /// multiplexed
    pub fn notify_snapshot(self: &Arc<Self>, key: ChannelKey, timeout: Duration) -> Result<()> {
        let image = self.hal.get_yuv_frame(key.pipe, key.channel, timeout)?;
        let handle = YuvFrameHandle::new(self.hal.clone(), image);
        self.publish(handle, false).map_err(|e| {
            warn!("{} snapshot frame dropped: {}", key, e);
            e
        })
    }

    pub fn in_flight(&self, key: ChannelKey) -> usize {
        self.channels.load().get(&key).map_or(0, |c| c.queue.len())
    }

    /// Return every in-flight buffer to hardware. Later releases of those
    /// frames find nothing and do nothing.
    pub fn clear(&self) -> usize {
        let channels = self.channels.load_full();
        let mut returned = 0;
        for channel in channels.values() {
            let drained = channel.queue.drain();
            returned += drained.len();
            drop(drained);
            channel.metrics.in_flight.set(0.0);
        }
        returned
    }

    pub fn stats(&self) -> Vec<(ChannelKey, QueueStats)> {
        let mut stats: Vec<_> = self
            .channels
            .load()
            .iter()
            .map(|(key, channel)| (*key, channel.queue.stats()))
            .collect();
        stats.sort_by_key(|(key, _)| *key);
        stats
    }
}

impl FrameRelease for FrameHub {
    fn release_frame(&self, frame: &FrameBuffer) {
        self.release(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::YuvImage;
    use crate::capture::sim::SimHal;
    use crate::pipeline::observer::{ChannelObserver, Observer};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how often a counter or gauge handle gets resolved
    #[derive(Default)]
    struct Registrations(AtomicUsize);

    impl metrics::Recorder for Registrations {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> Counter {
            self.0.fetch_add(1, Ordering::SeqCst);
            Counter::noop()
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> Gauge {
            self.0.fetch_add(1, Ordering::SeqCst);
            Gauge::noop()
        }

        fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    const KEY: ChannelKey = ChannelKey::new(0, 0);

    fn setup(depth: usize) -> (Arc<SimHal>, Arc<FrameHub>) {
        let sim = Arc::new(SimHal::new(Duration::from_millis(1)));
        let hub = FrameHub::new(sim.clone(), depth);
        hub.ensure_queues([KEY]);
        (sim, hub)
    }

    fn handle(sim: &Arc<SimHal>, seq: u64) -> YuvFrameHandle {
        let image = YuvImage {
            pipe: KEY.pipe,
            channel: KEY.channel,
            seq,
            width: 4,
            height: 4,
            stride: 4,
            pts: Duration::ZERO,
            phy_addr: 0x100 * seq,
            vir_addr: 0,
            data: Bytes::from_static(&[16; 24]),
        };
        YuvFrameHandle::new(sim.clone(), image)
    }

    #[test]
    fn no_observers_returns_buffer_synchronously() {
        let (sim, hub) = setup(5);
        for seq in 0..20 {
            hub.publish(handle(&sim, seq), false).unwrap();
            assert_eq!(sim.yuv_release_count(KEY, seq), 1);
        }
        assert_eq!(hub.in_flight(KEY), 0);
    }

    #[test]
    fn metric_handles_resolved_once_per_channel() {
        let recorder = Registrations::default();
        metrics::with_local_recorder(&recorder, || {
            let (sim, hub) = setup(5);
            for seq in 0..20 {
                hub.publish(handle(&sim, seq), false).unwrap();
            }
            hub.ensure_queues([KEY]);
        });
        // frames, dropped and in-flight for the one channel
        assert_eq!(recorder.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn overflow_drops_newest_keeps_oldest() {
        let (sim, hub) = setup(5);
        let (observer, rx) = ChannelObserver::bounded("slow", None, 16);
        hub.registry().add(KEY, observer as Arc<dyn Observer>);

        for seq in 0..7 {
            let result = hub.publish(handle(&sim, seq), false);
            if seq < 5 {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(VinError::QueueOverflow { depth: 5, .. })));
                assert_eq!(sim.yuv_release_count(KEY, seq), 1);
            }
            assert!(hub.in_flight(KEY) <= 5);
        }
        let held: Vec<_> = rx.try_iter().collect();
        assert_eq!(held.iter().map(FrameBuffer::sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        for seq in 0..5 {
            assert_eq!(sim.yuv_release_count(KEY, seq), 0);
        }

        for frame in &held {
            frame.release();
            frame.release();
        }
        for seq in 0..7 {
            assert_eq!(sim.yuv_release_count(KEY, seq), 1);
        }
        assert_eq!(hub.in_flight(KEY), 0);
    }

    #[test]
    fn multiplexed_frame_waits_for_every_holder() {
        let (sim, hub) = setup(5);
        let (a, rx_a) = ChannelObserver::bounded("a", None, 4);
        let (b, rx_b) = ChannelObserver::bounded("b", None, 4);
        hub.registry().add(KEY, a as Arc<dyn Observer>);
        hub.registry().add(KEY, b as Arc<dyn Observer>);

        hub.publish(handle(&sim, 3), true).unwrap();
        let fa = rx_a.try_recv().unwrap();
        let fb = rx_b.try_recv().unwrap();
        assert_eq!(fa.ref_count(), 2);

        fa.release();
        assert_eq!(sim.yuv_release_count(KEY, 3), 0);
        fb.release();
        assert_eq!(sim.yuv_release_count(KEY, 3), 1);
        fb.release();
        assert_eq!(sim.yuv_release_count(KEY, 3), 1);
    }

    #[test]
    fn clear_returns_outstanding_and_late_release_is_noop() {
        let (sim, hub) = setup(5);
        let (observer, rx) = ChannelObserver::bounded("hold", None, 8);
        hub.registry().add(KEY, observer as Arc<dyn Observer>);
        for seq in 0..3 {
            hub.publish(handle(&sim, seq), false).unwrap();
        }
        assert_eq!(hub.clear(), 3);
        for frame in rx.try_iter() {
            frame.release();
            assert_eq!(sim.yuv_release_count(KEY, frame.sequence()), 1);
        }
        assert_eq!(hub.stats()[0].1.released, 3);
    }
}
