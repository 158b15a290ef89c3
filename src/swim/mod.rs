mod node;
mod protocol;
#[allow(clippy::all)]
mod proto;
mod server;

pub use node::{NodeTable, SwimNode};
pub use protocol::Swimmer;
pub use server::SwimServer;

use crate::config::{FabricConfig, SwimConfig};
use crate::lamport::LamportClock;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// One SWIM instance: a single UDP server bound to the configured
/// address, plus one protocol executor per configured fabric (e.g.
/// "local" at 200ms period, "wan" at 1s) — all sharing one node table
/// and Lamport clock, each executor dialing out over its own ephemeral
/// client socket.
pub struct SwimInstance {
    pub server: SwimServer,
    pub swimmers: Vec<Arc<Swimmer>>,
    pub nodes: Arc<Mutex<NodeTable>>,
}

impl SwimInstance {
    pub async fn start(local_name: String, bind_addr: SocketAddr, fabrics: &[FabricConfig], seed_nodes: &[String]) -> std::io::Result<Self> {
        let nodes = Arc::new(Mutex::new(NodeTable::new()));
        let clock = Arc::new(LamportClock::new());

        {
            let mut table = nodes.lock().expect("node table lock poisoned");
            for seed in seed_nodes {
                if let Ok(addr) = seed.parse::<SocketAddr>() {
                    table.get_or_insert(seed, addr);
                } else {
                    tracing::warn!(seed = %seed, "swim: unable to parse seed node address, skipping");
                }
            }
        }

        let server = SwimServer::bind(local_name.clone(), bind_addr, nodes.clone(), clock.clone()).await?;

        let mut swimmers = Vec::with_capacity(fabrics.len());
        for fabric in fabrics {
            let swimmer = Swimmer::new(
                local_name.clone(),
                bind_addr.ip(),
                nodes.clone(),
                clock.clone(),
                Duration::from_millis(fabric.period_ms),
                Duration::from_millis(fabric.rtt_budget_ms),
            )
            .await?;
            info!(fabric = %fabric.name, "swim: fabric started");
            swimmers.push(Arc::new(swimmer));
        }

        Ok(Self {
            server,
            swimmers,
            nodes,
        })
    }

    /// Spawn the server loop and every fabric's protocol executor on
    /// independent long-lived tasks.
    pub fn spawn(self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.swimmers.len() + 1);
        handles.push(tokio::spawn(async move {
            if let Err(e) = self.server.serve().await {
                tracing::error!(%e, "swim: server loop exited");
            }
        }));
        for swimmer in self.swimmers {
            handles.push(tokio::spawn(async move {
                swimmer.run().await;
            }));
        }
        handles
    }
}

/// Start the configured SWIM instance (one UDP server, one executor per
/// fabric), returning all spawned task handles.
pub async fn start_fabrics(cfg: &SwimConfig) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
    let bind_addr: SocketAddr = cfg.bind_addr.parse()?;
    let instance = SwimInstance::start(cfg.local_name.clone(), bind_addr, &cfg.fabrics, &cfg.seed_nodes).await?;
    Ok(instance.spawn())
}
