//! Instance Supervisor (C9) — registers this process with the remote
//! mirror at startup, heartbeats every 30s, and deregisters on graceful
//! shutdown (§2, §4.9 ambient component).

use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::mirror::{MirrorEvent, RemoteMirror};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Supervisor {
    instance_id: String,
    hostname: String,
    api_port: u16,
    mirror: RemoteMirror,
}

impl Supervisor {
    pub fn new(instance_id: String, api_port: u16, mirror: RemoteMirror) -> Self {
        let hostname = hostname_or_default();
        Self {
            instance_id,
            hostname,
            api_port,
            mirror,
        }
    }

    fn heartbeat(&self, status: &str) {
        self.mirror.send(MirrorEvent::InstanceHeartbeat {
            instance_id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            api_port: self.api_port,
            status: status.to_string(),
            ts: Utc::now(),
        });
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.heartbeat("starting");
        info!(instance_id = %self.instance_id, api_port = self.api_port, "instance registered");

        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat("running"),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.heartbeat("stopped");
        info!(instance_id = %self.instance_id, "instance deregistered");
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
