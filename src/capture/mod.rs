pub mod frame;
pub mod hal;
pub mod sensor;
pub mod sim;

pub use frame::{FrameBuffer, FrameMetadata, HdrMode, RawImage, YuvImage};
pub use hal::{IspIq, Platform, TuningCtrl, VinHal};
pub use sensor::{Sensor, SensorAttr, SensorConfigSource, SensorFactory, SensorKind};
