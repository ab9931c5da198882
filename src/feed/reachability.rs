//! Connectivity monitor.
//!
//! De-duplicated reachable/unreachable signal. The engine resyncs on the
//! unreachable→reachable edge because time spent offline invalidates any
//! in-flight sequence continuity; on the reachable→unreachable edge it only
//! raises the connecting indicator and keeps the last published state.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

pub struct ReachabilityMonitor {
    tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReachabilityMonitor {
    /// A monitor that always reports reachable. Used when no probe target
    /// is configured; the transport's own failures still drive resyncs.
    pub fn always_up() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx, task: None }
    }

    /// Probe a TCP endpoint on a fixed cadence and publish edges.
    pub fn spawn_probe(
        host: String,
        port: u16,
        probe_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let (tx, _) = watch::channel(true);
        let probe_tx = tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let up = matches!(
                    timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await,
                    Ok(Ok(_))
                );
                publish(&probe_tx, up);
            }
        });

        Self {
            tx,
            task: Some(task),
        }
    }

    /// Latest-value channel of the reachability flag. `watch` semantics
    /// de-duplicate for subscribers: they wake only on edges.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Inject a state by hand (tests, platform-specific monitors).
    pub fn set_reachable(&self, up: bool) {
        publish(&self.tx, up);
    }

    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }
}

fn publish(tx: &watch::Sender<bool>, up: bool) {
    let changed = tx.send_if_modified(|current| {
        if *current == up {
            return false;
        }
        *current = up;
        true
    });

    if changed {
        if up {
            info!("network_reachable");
        } else {
            info!("network_unreachable");
        }
    } else {
        debug!(up, "reachability_probe");
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
