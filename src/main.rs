//! vinmux demo: simulated sensors streaming to channel consumers until Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vinmux::capture::sensor::ScenarioTable;
use vinmux::capture::sim::{SimHal, SimSensorFactory};
use vinmux::capture::Platform;
use vinmux::pipeline::ChannelObserver;
use vinmux::{ChannelKey, Config, SensorManager};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vinmux=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("vinmux launching...");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let source = Arc::new(ScenarioTable::from_config(&config));

    // ~30fps simulated devices
    let sim = Arc::new(SimHal::new(Duration::from_millis(33)));
    let factory = Arc::new(SimSensorFactory::new(sim.clone()));
    let mut manager = SensorManager::new(
        config.pipeline.clone(),
        factory,
        source,
        Platform::from_single(sim.clone()),
    );

    manager.init()?;

    let mut keys = Vec::new();
    for index in 0..manager.sensor_count() {
        if let Some(sensor) = manager.sensor(index) {
            for pipe in sensor.config().pipes.iter().filter(|p| !p.snapshot) {
                keys.extend(pipe.channels.iter().map(|c| ChannelKey::new(pipe.pipe_id, c.channel)));
            }
        }
    }

    let mut consumers = Vec::new();
    for key in keys {
        let (observer, rx) = ChannelObserver::bounded(format!("consumer{key}"), Some(key), 4);
        if !manager.register_observer(key.pipe, key.channel, observer)? {
            continue;
        }
        consumers.push(tokio::spawn(async move {
            let mut frames = 0u64;
            while let Ok(frame) = rx.recv_async().await {
                debug!("{} consumed seq {}", key, frame.sequence());
                frames += 1;
                frame.release();
            }
            info!("{} consumer done after {} frames", key, frames);
        }));
    }

    manager.start()?;
    info!("streaming, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("vinmux shutting down");
    tokio::task::spawn_blocking(move || -> vinmux::Result<()> {
        manager.stop()?;
        for (key, stats) in manager.queue_stats() {
            info!(
                "{} queued {} dropped {} released {}",
                key, stats.queued, stats.dropped, stats.released
            );
        }
        manager.deinit()
    })
    .await??;

    // Observers were dropped with the manager, which closes every channel
    for consumer in consumers {
        consumer.await?;
    }
    Ok(())
}
