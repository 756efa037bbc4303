//! Background thread driving `Stage::poll` (join timeouts, stalled throttle tickets).

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::graph::{Graph, Router};

#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<u64>>,
}

impl MaintenanceHandle {
    /// Tick `graph` every `interval` until stopped or the graph is dropped.
    pub fn spawn(graph: &Graph, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(anyhow!("maintenance interval must be non-zero"));
        }
        let router = graph.router();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("pipeline-maintenance".into())
            .spawn(move || run_ticks(router, interval, shutdown_thread))?;
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    /// Stop the thread and wait for it. Returns the number of ticks run.
    pub fn stop(mut self) -> Result<u64> {
        self.halt()
    }

    fn halt(&mut self) -> Result<u64> {
        self.shutdown.store(true, Ordering::SeqCst);
        let Some(join) = self.join.take() else {
            return Ok(0);
        };
        join.thread().unpark();
        join.join()
            .map_err(|_| anyhow!("maintenance thread panicked"))
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            log::error!("{}", err);
        }
    }
}

fn run_ticks(router: Weak<Router>, interval: Duration, shutdown: Arc<AtomicBool>) -> u64 {
    let mut ticks = 0;
    let mut next = Instant::now() + interval;
    loop {
        let now = Instant::now();
        if now < next {
            std::thread::park_timeout(next - now);
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        if now < next {
            continue;
        }
        let Some(router) = router.upgrade() else {
            log::debug!("maintenance: graph dropped");
            break;
        };
        router.tick(now);
        ticks += 1;
        next = now + interval;
    }
    ticks
}
