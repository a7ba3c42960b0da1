use std::time::Duration;

use shared::protocol::Envelope;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::transport::Frame;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Sends a `ping` envelope on the transport every interval until stopped.
///
/// The first ping goes out one interval after start. The monitor also ends on
/// its own once the transport's outbound side is gone.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(outbound: mpsc::UnboundedSender<Frame>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if outbound.is_closed() {
                    debug!("heartbeat: transport closed, stopping");
                    break;
                }
                let ping = match serde_json::to_string(&Envelope::ping()) {
                    Ok(ping) => ping,
                    Err(err) => {
                        warn!(error = %err, "heartbeat: failed to encode ping");
                        continue;
                    }
                };
                if outbound.send(Frame::Text(ping)).is_err() {
                    debug!("heartbeat: transport gone, stopping");
                    break;
                }
                trace!("heartbeat: ping sent");
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/heartbeat_tests.rs"]
mod tests;
