//! Worker thread lifecycle: Created -> Running -> StopRequested -> Joined

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::error::Result;
use crate::utils;

/// Cooperative cancellation flag, checked once per loop iteration
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    StopRequested = 2,
    Joined = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::StopRequested,
            _ => WorkerState::Joined,
        }
    }
}

/// Owning handle for one worker thread
pub struct WorkerHandle {
    name: String,
    token: StopToken,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread, optionally pinned to `cpu`
    pub fn spawn<F>(name: impl Into<String>, cpu: Option<usize>, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let name = name.into();
        let token = StopToken::new();
        let state = Arc::new(AtomicU8::new(WorkerState::Created as u8));

        let thread_token = token.clone();
        let thread_state = state.clone();
        let thread = utils::spawn_named(&name, cpu, move || {
            // A stop requested before the thread got going must not be overwritten
            let _ = thread_state.compare_exchange(
                WorkerState::Created as u8,
                WorkerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            body(thread_token);
        })?;

        Ok(Self {
            name,
            token,
            state,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Signal the worker; it notices at its next loop iteration
    pub fn request_stop(&self) {
        self.token.stop();
        if self.state() != WorkerState::Joined {
            self.state
                .store(WorkerState::StopRequested as u8, Ordering::Release);
        }
    }

    /// Wait for the thread to exit. Bounded by the longest hardware timeout
    /// the worker can be blocked in.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("worker {} panicked", self.name);
            } else {
                info!("worker {} joined", self.name);
            }
        }
        self.state.store(WorkerState::Joined as u8, Ordering::Release);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_stop();
            self.join();
        }
    }
}

/// Two-phase shutdown: signal every worker first so their timeouts overlap,
/// then join them all.
pub fn stop_all(workers: &mut Vec<WorkerHandle>) {
    for worker in workers.iter() {
        worker.request_stop();
    }
    for worker in workers.iter_mut() {
        worker.join();
    }
    workers.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn lifecycle_states() {
        let (tx, rx) = flume::bounded(1);
        let mut worker = WorkerHandle::spawn("test_worker", None, move |stop| {
            let _ = tx.send(());
            while !stop.is_stopped() {
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        worker.request_stop();
        assert_eq!(worker.state(), WorkerState::StopRequested);
        worker.join();
        assert_eq!(worker.state(), WorkerState::Joined);
    }

    #[test]
    fn stop_all_overlaps_waits() {
        let mut workers: Vec<_> = (0..4)
            .map(|i| {
                WorkerHandle::spawn(format!("slow_{i}"), None, |stop| {
                    while !stop.is_stopped() {
                        // Stand-in for a blocking hardware call with a timeout
                        std::thread::sleep(Duration::from_millis(100));
                    }
                })
                .unwrap()
            })
            .collect();

        let start = Instant::now();
        stop_all(&mut workers);
        assert!(start.elapsed() < Duration::from_millis(350));
        assert!(workers.is_empty());
    }
}
