//! Bookkeeping for running tunnel tasks. Every tunnel, whether declared in
//! the config file or started through the API, lives here under a `Uuid` so
//! it can be inspected and stopped later.

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::culvert::telemetry;
use crate::culvert::tunnel::{
    STOP_GRACE, TunnelError, TunnelStatus,
    client::{Client, ClientOptions},
    server::{Server, ServerOptions},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Server,
    Client,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Server => write!(f, "server"),
            TunnelKind::Client => write!(f, "client"),
        }
    }
}

/// Point-in-time view of one registered tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: Uuid,
    pub kind: TunnelKind,
    pub started_at_unix_ms: u64,
    #[serde(flatten)]
    pub status: TunnelStatus,
}

struct TunnelEntry {
    kind: TunnelKind,
    started_at_unix_ms: u64,
    status: watch::Receiver<TunnelStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

pub struct Registry {
    tunnels: DashMap<Uuid, TunnelEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Validates the options, spawns the server task, and registers it.
    /// Configuration problems surface here, before anything runs.
    pub fn start_server(&self, opts: ServerOptions) -> Result<Uuid, TunnelError> {
        let server = Server::new(opts)?;
        let status = server.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = Uuid::new_v4();

        let task = tokio::spawn(async move {
            let res = server.listen_and_serve(shutdown_rx).await;
            if let Err(err) = &res {
                tracing::warn!(id = %id, err = %format!("{err:#}"), "registry: server tunnel ended with error");
            }
            res
        });

        self.tunnels.insert(
            id,
            TunnelEntry {
                kind: TunnelKind::Server,
                started_at_unix_ms: telemetry::now_unix_ms(),
                status,
                shutdown: shutdown_tx,
                task,
            },
        );
        metrics::counter!("culvert_tunnels_started_total", "kind" => "server").increment(1);
        tracing::info!(id = %id, "registry: server tunnel registered");
        Ok(id)
    }

    pub fn start_client(&self, opts: ClientOptions) -> Result<Uuid, TunnelError> {
        let client = Client::new(opts)?;
        let status = client.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = Uuid::new_v4();

        let task = tokio::spawn(async move {
            let res = client.run(shutdown_rx).await;
            if let Err(err) = &res {
                tracing::warn!(id = %id, err = %format!("{err:#}"), "registry: client tunnel ended with error");
            }
            res
        });

        self.tunnels.insert(
            id,
            TunnelEntry {
                kind: TunnelKind::Client,
                started_at_unix_ms: telemetry::now_unix_ms(),
                status,
                shutdown: shutdown_tx,
                task,
            },
        );
        metrics::counter!("culvert_tunnels_started_total", "kind" => "client").increment(1);
        tracing::info!(id = %id, "registry: client tunnel registered");
        Ok(id)
    }

    pub fn status(&self, id: &Uuid) -> Option<TunnelStatus> {
        self.tunnels.get(id).map(|e| e.status.borrow().clone())
    }

    /// Live view of the tunnel's status channel, for callers that want to
    /// wait on a transition instead of sampling.
    pub fn watch(&self, id: &Uuid) -> Option<watch::Receiver<TunnelStatus>> {
        self.tunnels.get(id).map(|e| e.status.clone())
    }

    pub fn info(&self, id: &Uuid) -> Option<TunnelInfo> {
        self.tunnels.get(id).map(|e| TunnelInfo {
            id: *id,
            kind: e.kind,
            started_at_unix_ms: e.started_at_unix_ms,
            status: e.status.borrow().clone(),
        })
    }

    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut out = Vec::with_capacity(self.tunnels.len());
        for e in self.tunnels.iter() {
            out.push(TunnelInfo {
                id: *e.key(),
                kind: e.kind,
                started_at_unix_ms: e.started_at_unix_ms,
                status: e.status.borrow().clone(),
            });
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    /// Stops the tunnel with this id if it exists and is of the given kind.
    /// Returns whether anything was stopped.
    pub async fn stop(&self, id: &Uuid, kind: TunnelKind) -> bool {
        let Some((_, entry)) = self.tunnels.remove_if(id, |_, e| e.kind == kind) else {
            return false;
        };
        stop_entry(id, entry).await;
        true
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.tunnels.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.tunnels.remove(&id) {
                stop_entry(&id, entry).await;
            }
        }
    }
}

async fn stop_entry(id: &Uuid, mut entry: TunnelEntry) {
    let _ = entry.shutdown.send(true);
    match tokio::time::timeout(STOP_GRACE, &mut entry.task).await {
        Ok(join) => {
            if let Err(err) = join {
                if !err.is_cancelled() {
                    tracing::warn!(id = %id, err = %err, "registry: tunnel task panicked");
                }
            }
        }
        Err(_) => {
            tracing::warn!(id = %id, "registry: tunnel ignored shutdown, aborting");
            entry.task.abort();
        }
    }
    tracing::info!(id = %id, kind = %entry.kind, "registry: tunnel stopped");
}
