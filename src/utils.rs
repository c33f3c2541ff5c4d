use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::error::{Result, VinError};

/// Spawn a named OS thread, pinned to `cpu` when one is given and exists
pub fn spawn_named<F>(name: &str, cpu: Option<usize>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(cpu) = cpu {
                pin_current_thread(&thread_name, cpu);
            }
            body();
        })
        .map_err(|source| VinError::Spawn {
            name: name.to_string(),
            source,
        })
}

fn pin_current_thread(name: &str, cpu: usize) {
    let core = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|c| c.id == cpu);

    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            info!("{} pinned to cpu {}", name, cpu)
        }
        _ => warn!("{} could not be pinned to cpu {}", name, cpu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_gets_name() {
        let handle = spawn_named("RAW_DISP_0", None, || {
            assert_eq!(thread::current().name(), Some("RAW_DISP_0"));
        })
        .unwrap();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn bogus_cpu_still_runs() {
        let handle = spawn_named("pinned", Some(usize::MAX), || {}).unwrap();
        assert!(handle.join().is_ok());
    }
}
