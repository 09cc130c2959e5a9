use std::time::Duration;

use tokio::{sync::watch, time::sleep};
use tracing::{info, warn};

use crate::live::api::SharedMatchApi;

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shared "is the network reachable" flag.
///
/// The platform (or the health check) flips it; the queue and the sync channel read it.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Monitor starting at `initially_online`.
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        Self { online }
    }

    /// Current reachability.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Returns whether the flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        })
    }

    /// Watch reachability changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

/// Poll the server and keep the monitor current, backing off while it is unreachable.
pub async fn run_health_check(monitor: ConnectivityMonitor, api: SharedMatchApi) {
    let mut delay = INITIAL_DELAY;

    loop {
        match api.health().await {
            Ok(()) => {
                if monitor.set_online(true) {
                    info!("server reachable again; leaving offline mode");
                }
                delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                if monitor.set_online(false) {
                    warn!(error = %err, "server unreachable; entering offline mode");
                }
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}
