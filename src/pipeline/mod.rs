pub mod dispatch;
pub mod framerate;
pub mod hub;
pub mod observer;
pub mod queue;
pub mod retrieval;
pub mod snapshot;
pub mod tuning;
pub mod worker;

pub use dispatch::{DispatchPlan, PipeRoute, RawDispatcher, SensorGate};
pub use framerate::{FrameRate, FramerateDivider};
pub use hub::FrameHub;
pub use observer::{ChannelObserver, Observer, ObserverRegistry, TransAttr};
pub use queue::QueueStats;
pub use retrieval::YuvRetriever;
pub use snapshot::{IqSnapshot, SnapshotContext, SnapshotProc, SnapshotRequest};
pub use tuning::TuningSession;
pub use worker::{stop_all, StopToken, WorkerHandle, WorkerState};
