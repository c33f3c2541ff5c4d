//! Sensor instances and where their configuration comes from

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::frame::HdrMode;
use crate::error::{HalResult, VinError};
use crate::pipeline::snapshot::SnapshotProc;
use crate::{ChannelId, DevId, PipeId};

/// Upper bound on ISP output channels per pipe
pub const MAX_CHANNELS_PER_PIPE: usize = 3;

/// Sensor models known at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Os04a10,
    Os08a20,
    Sc450ai,
    Imx678,
    /// Pattern generator, no physical sensor attached
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelAttr {
    pub channel: ChannelId,
    pub width: u32,
    pub height: u32,
    pub framerate: f32,
    pub compressed: bool,
    /// Several observers may hold the same frame at once
    pub multiplex: bool,
}

impl Default for ChannelAttr {
    fn default() -> Self {
        Self {
            channel: 0,
            width: 1920,
            height: 1080,
            framerate: 30.0,
            compressed: false,
            multiplex: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeAttr {
    pub pipe_id: PipeId,
    pub framerate: f32,
    pub snapshot: bool,
    /// Frames on this pipe come from a simulated (dummy) capture
    pub dummy: bool,
    pub tuning: bool,
    pub tuning_port: u16,
    pub channels: Vec<ChannelAttr>,
}

impl Default for PipeAttr {
    fn default() -> Self {
        Self {
            pipe_id: 0,
            framerate: 30.0,
            snapshot: false,
            dummy: false,
            tuning: false,
            tuning_port: 8082,
            channels: vec![ChannelAttr::default()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sns_id: u8,
    pub dev_id: DevId,
    pub kind: SensorKind,
    pub hdr_mode: HdrMode,
    pub framerate: f32,
    pub enable_flash: bool,
    pub pipes: Vec<PipeAttr>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sns_id: 0,
            dev_id: 0,
            kind: SensorKind::default(),
            hdr_mode: HdrMode::Linear,
            framerate: 30.0,
            enable_flash: false,
            pipes: vec![PipeAttr::default()],
        }
    }
}

impl SensorConfig {
    pub fn pipe(&self, pipe: PipeId) -> Option<&PipeAttr> {
        self.pipes.iter().find(|p| p.pipe_id == pipe)
    }

    pub fn channel(&self, pipe: PipeId, channel: ChannelId) -> Option<&ChannelAttr> {
        self.pipe(pipe)?
            .channels
            .iter()
            .find(|c| c.channel == channel)
    }
}

/// Runtime-adjustable sensor attributes
#[derive(Debug, Clone, PartialEq)]
pub struct SensorAttr {
    pub framerate: f32,
    pub hdr_mode: HdrMode,
    pub mirror: bool,
    pub flip: bool,
}

impl From<&SensorConfig> for SensorAttr {
    fn from(cfg: &SensorConfig) -> Self {
        Self {
            framerate: cfg.framerate,
            hdr_mode: cfg.hdr_mode,
            mirror: false,
            flip: false,
        }
    }
}

/// Called by a sensor after construction and before it opens, so the
/// application can adjust attributes. Returning `false` aborts the open.
pub type AttrUpdateHook = Arc<dyn Fn(&SensorConfig, &mut SensorAttr) -> bool + Send + Sync>;

/// Capabilities the manager needs from a sensor instance
pub trait Sensor: Send {
    fn kind(&self) -> SensorKind;
    fn config(&self) -> &SensorConfig;

    fn pipe_count(&self) -> usize {
        self.config().pipes.len()
    }

    fn channel_attr(&self, pipe: PipeId, channel: ChannelId) -> Option<ChannelAttr> {
        self.config().channel(pipe, channel).cloned()
    }

    fn register_attr_hook(&mut self, hook: AttrUpdateHook);

    fn init(&mut self) -> HalResult<()>;
    fn open(&mut self) -> HalResult<()>;
    fn close(&mut self) -> HalResult<()>;
    fn start_isp_loop(&mut self) -> HalResult<()>;
    fn stop_isp_loop(&mut self) -> HalResult<()>;
    fn change_hdr_mode(&mut self, mode: HdrMode) -> HalResult<()>;

    fn attr(&self) -> SensorAttr;
    fn set_attr(&mut self, attr: SensorAttr);
    /// Push the current attributes down to the hardware
    fn apply_attr(&mut self) -> HalResult<()>;

    /// Sensor specific snapshot procedure overriding the built-in one
    fn snapshot_proc(&self) -> Option<Arc<dyn SnapshotProc>> {
        None
    }
}

/// Builds and tears down sensor instances
pub trait SensorFactory: Send + Sync {
    fn create(&self, config: &SensorConfig) -> Result<Box<dyn Sensor>, VinError>;

    fn destroy(&self, sensor: Box<dyn Sensor>) {
        drop(sensor);
    }
}

/// Where sensor configuration is read from
pub trait SensorConfigSource: Send + Sync {
    fn sensor_count(&self) -> usize;
    fn sensor_config(&self, index: usize) -> Option<SensorConfig>;
    /// Select which scenario subsequent reads refer to
    fn select_scenario(&self, scenario: i32);
    fn current_scenario(&self) -> i32;
}

/// Scenario id -> sensor list, read from the config file
#[derive(Debug, Default)]
pub struct ScenarioTable {
    scenarios: BTreeMap<i32, Vec<SensorConfig>>,
    current: AtomicI32,
}

impl ScenarioTable {
    pub fn new(scenarios: BTreeMap<i32, Vec<SensorConfig>>, current: i32) -> Self {
        Self {
            scenarios,
            current: AtomicI32::new(current),
        }
    }

    pub fn from_config(config: &crate::Config) -> Self {
        let scenarios = config
            .scenarios
            .iter()
            .map(|s| (s.id, s.sensors.clone()))
            .collect();
        Self::new(scenarios, config.scenario)
    }

    fn current_sensors(&self) -> Option<&Vec<SensorConfig>> {
        self.scenarios.get(&self.current.load(Ordering::Acquire))
    }
}

impl SensorConfigSource for ScenarioTable {
    fn sensor_count(&self) -> usize {
        self.current_sensors().map_or(0, Vec::len)
    }

    fn sensor_config(&self, index: usize) -> Option<SensorConfig> {
        self.current_sensors()?.get(index).cloned()
    }

    fn select_scenario(&self, scenario: i32) {
        self.current.store(scenario, Ordering::Release);
    }

    fn current_scenario(&self) -> i32 {
        self.current.load(Ordering::Acquire)
    }
}

/// Sensor count as seen by the display layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorTopology {
    Single,
    Dual,
}

impl SensorTopology {
    pub fn from_count(count: usize) -> Self {
        if count == 1 {
            SensorTopology::Single
        } else {
            SensorTopology::Dual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_scenarios() -> ScenarioTable {
        let mut map = BTreeMap::new();
        map.insert(0, vec![SensorConfig::default()]);
        map.insert(
            1,
            vec![
                SensorConfig::default(),
                SensorConfig {
                    sns_id: 1,
                    dev_id: 1,
                    ..SensorConfig::default()
                },
            ],
        );
        ScenarioTable::new(map, 0)
    }

    #[test]
    fn scenario_selection_changes_sensor_list() {
        let table = two_scenarios();
        assert_eq!(table.sensor_count(), 1);
        table.select_scenario(1);
        assert_eq!(table.sensor_count(), 2);
        assert_eq!(table.sensor_config(1).map(|c| c.dev_id), Some(1));
        table.select_scenario(7);
        assert_eq!(table.sensor_count(), 0);
        assert!(table.sensor_config(0).is_none());
    }

    #[test]
    fn channel_lookup() {
        let cfg = SensorConfig::default();
        assert!(cfg.channel(0, 0).is_some());
        assert!(cfg.channel(0, 2).is_none());
        assert!(cfg.channel(5, 0).is_none());
    }

    #[test]
    fn topology_from_count() {
        assert_eq!(SensorTopology::from_count(1), SensorTopology::Single);
        assert_eq!(SensorTopology::from_count(2), SensorTopology::Dual);
    }
}
