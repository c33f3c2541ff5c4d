pub mod capture;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use capture::sensor::{ChannelAttr, PipeAttr, SensorConfig};
pub use capture::{FrameBuffer, HdrMode};
pub use error::{HalError, Result, VinError};
pub use manager::SensorManager;
pub use pipeline::{FrameRate, Observer};

pub type DevId = u8;
pub type PipeId = u8;
pub type ChannelId = u8;

/// (pipe, channel) pair identifying one ISP output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub pipe: PipeId,
    pub channel: ChannelId,
}

impl ChannelKey {
    pub const fn new(pipe: PipeId, channel: ChannelId) -> Self {
        Self { pipe, channel }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.pipe, self.channel)
    }
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    /// Scenario selected at start-up
    pub scenario: i32,
    pub scenarios: Vec<ScenarioConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames lent out per (pipe, channel) before new ones are dropped
    pub queue_depth: usize,
    pub yuv_timeout_ms: u64,
    pub raw_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    /// Sleep between checks while a sensor is paused
    pub poll_interval_ms: u64,
    pub tuning_stream_port: u16,
    /// Device pipe tag meaning "route to the flash snapshot path"
    pub flash_snapshot_tag: PipeId,
    pub dispatch_cpu: Option<usize>,
    pub retrieval_cpu: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub id: i32,
    pub sensors: Vec<SensorConfig>,
}

impl PipelineConfig {
    pub fn yuv_timeout(&self) -> Duration {
        Duration::from_millis(self.yuv_timeout_ms)
    }

    pub fn raw_timeout(&self) -> Duration {
        Duration::from_millis(self.raw_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            yuv_timeout_ms: 1000,
            raw_timeout_ms: 3000,
            snapshot_timeout_ms: 3000,
            poll_interval_ms: 10,
            tuning_stream_port: 6000,
            flash_snapshot_tag: 2,
            dispatch_cpu: None,
            retrieval_cpu: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let channel = ChannelAttr {
            width: 2688,
            height: 1520,
            ..ChannelAttr::default()
        };
        Self {
            pipeline: PipelineConfig::default(),
            scenario: 0,
            scenarios: vec![ScenarioConfig {
                id: 0,
                sensors: vec![SensorConfig {
                    pipes: vec![
                        PipeAttr {
                            pipe_id: 0,
                            framerate: 20.0,
                            channels: vec![ChannelAttr {
                                framerate: 20.0,
                                ..channel.clone()
                            }],
                            ..PipeAttr::default()
                        },
                        PipeAttr {
                            pipe_id: 1,
                            framerate: 10.0,
                            channels: vec![ChannelAttr {
                                framerate: 10.0,
                                ..channel
                            }],
                            ..PipeAttr::default()
                        },
                    ],
                    ..SensorConfig::default()
                }],
            }],
        }
    }
}

impl Config {
    /// Load from a TOML file, with `VINMUX__SECTION__KEY` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("VINMUX").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Hard errors for unusable values; rate oversubscription only warns.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_depth == 0 {
            return Err(VinError::Config("pipeline.queue_depth must be at least 1".into()));
        }

        for scenario in &self.scenarios {
            for sensor in &scenario.sensors {
                let source = FrameRate::from_fps(sensor.framerate);
                let demand = sensor
                    .pipes
                    .iter()
                    .fold(FrameRate::ZERO, |acc, p| acc + FrameRate::from_fps(p.framerate));
                if demand > source {
                    warn!(
                        "scenario {} sensor {}: pipe rates sum to {:.2} fps, device only delivers {:.2} fps",
                        scenario.id,
                        sensor.sns_id,
                        demand.as_f64(),
                        source.as_f64()
                    );
                }
                for pipe in &sensor.pipes {
                    if pipe.channels.len() > capture::sensor::MAX_CHANNELS_PER_PIPE {
                        return Err(VinError::Config(format!(
                            "pipe {} has {} channels, at most {} supported",
                            pipe.pipe_id,
                            pipe.channels.len(),
                            capture::sensor::MAX_CHANNELS_PER_PIPE
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
