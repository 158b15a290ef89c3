use crate::lamport::LamportClock;
use crate::swim::node::NodeTable;
use crate::swim::proto::{Ack, SwimMessage};
use prost::Message;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, error};

const MAX_DATAGRAM: usize = 1500;

/// The UDP server half of one SWIM instance: receives ping/ping-req,
/// applies piggybacked updates, and replies with an ack plus the
/// current outbound dissemination log.
pub struct SwimServer {
    socket: UdpSocket,
    local_name: String,
    nodes: Arc<Mutex<NodeTable>>,
    clock: Arc<LamportClock>,
}

impl SwimServer {
    pub async fn bind(local_name: String, bind_addr: SocketAddr, nodes: Arc<Mutex<NodeTable>>, clock: Arc<LamportClock>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket,
            local_name,
            nodes,
            clock,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve forever; a malformed packet is logged and skipped, it does
    /// not terminate the loop.
    pub async fn serve(&self) -> std::io::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if let Err(e) = self.serve_once(&buf[..n], from).await {
                error!(%e, "swim: error serving datagram");
            }
        }
    }

    async fn serve_once(&self, datagram: &[u8], from: SocketAddr) -> std::io::Result<()> {
        let incoming = match SwimMessage::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                debug!(%e, "swim: error unmarshalling message, ignoring");
                return Ok(());
            }
        };

        {
            let mut table = self.nodes.lock().expect("node table lock poisoned");
            table.apply_updates(incoming.dissemination_updates.clone(), from);
        }
        for update in &incoming.dissemination_updates {
            self.clock.on_received_epoch(update.timestamp);
        }

        let ack = if let Some(ping) = &incoming.ping {
            self.serve_ping(ping, from)
        } else if let Some(ping_req) = &incoming.ping_req {
            self.serve_ping_req(ping_req, from).await
        } else {
            None
        };

        let outbound = self.nodes.lock().expect("node table lock poisoned").outbound_updates.clone();
        let reply = SwimMessage {
            seq: incoming.seq,
            ping: None,
            ping_req: None,
            ack,
            dissemination_updates: outbound,
        };

        let mut out = Vec::with_capacity(MAX_DATAGRAM);
        if reply.encode(&mut out).is_err() {
            error!("swim: error marshalling reply");
            return Ok(());
        }
        if out.len() > MAX_DATAGRAM {
            error!("swim: reply packet too big to send over UDP");
            return Ok(());
        }
        self.socket.send_to(&out, from).await?;
        Ok(())
    }

    /// A ping means the source node exists and is alive.
    fn serve_ping(&self, ping: &crate::swim::proto::Ping, from: SocketAddr) -> Option<Ack> {
        self.nodes
            .lock()
            .expect("node table lock poisoned")
            .set_up_local(&ping.source_node, from, true, &self.clock);
        Some(Ack { alive: true })
    }

    /// Source is marked up; the dest node is pinged locally and the
    /// result (alive=false on any local failure) relayed as the ack.
    async fn serve_ping_req(&self, ping_req: &crate::swim::proto::PingReq, from: SocketAddr) -> Option<Ack> {
        self.nodes
            .lock()
            .expect("node table lock poisoned")
            .set_up_local(&ping_req.source_node, from, true, &self.clock);

        let dest_addr = match parse_hostport(&ping_req.dest_node) {
            Ok(addr) => addr,
            Err(_) => return Some(Ack { alive: false }),
        };

        match local_pingack(dest_addr, &self.local_name).await {
            Ok(alive) => Some(Ack { alive }),
            Err(_) => Some(Ack { alive: false }),
        }
    }
}

fn parse_hostport(hostport: &str) -> Result<SocketAddr, crate::error::BackplaneError> {
    hostport
        .parse::<SocketAddr>()
        .map_err(|_| crate::error::BackplaneError::BadIp(hostport.to_string()))
}

/// One-shot ping issued directly by the server loop (not through a
/// fabric's long-lived protocol executor) to satisfy a ping-req.
async fn local_pingack(dest: SocketAddr, local_name: &str) -> std::io::Result<bool> {
    use crate::swim::proto::{Ping, SwimMessage};
    use std::time::Duration;

    let socket = UdpSocket::bind(SocketAddr::new(
        if dest.is_ipv4() {
            std::net::Ipv4Addr::UNSPECIFIED.into()
        } else {
            std::net::Ipv6Addr::UNSPECIFIED.into()
        },
        0,
    ))
    .await?;

    let msg = SwimMessage {
        seq: 0,
        ping: Some(Ping {
            source_node: local_name.to_string(),
        }),
        ping_req: None,
        ack: None,
        dissemination_updates: vec![],
    };
    let mut buf = Vec::new();
    msg.encode(&mut buf).ok();
    socket.send_to(&buf, dest).await?;

    let mut recv_buf = [0u8; MAX_DATAGRAM];
    let result = tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut recv_buf)).await;
    match result {
        Ok(Ok((n, _))) => {
            let reply = SwimMessage::decode(&recv_buf[..n])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(reply.ack.map(|a| a.alive).unwrap_or(false))
        }
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "local pingack timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_req_to_unreachable_node_replies_not_alive() {
        let nodes = Arc::new(Mutex::new(NodeTable::new()));
        let clock = Arc::new(LamportClock::new());
        let proxy = SwimServer::bind(
            "proxy".to_string(),
            "127.0.0.1:0".parse().unwrap(),
            nodes,
            clock,
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let msg = SwimMessage {
            seq: 2,
            ping: None,
            ping_req: Some(crate::swim::proto::PingReq {
                source_node: client.local_addr().unwrap().to_string(),
                dest_node: "127.0.0.1:1".to_string(),
            }),
            ack: None,
            dissemination_updates: vec![],
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        client.send_to(&buf, proxy.local_addr().unwrap()).await.unwrap();

        tokio::spawn(async move {
            let mut recv_buf = [0u8; MAX_DATAGRAM];
            let (n, from) = proxy.socket.recv_from(&mut recv_buf).await.unwrap();
            proxy.serve_once(&recv_buf[..n], from).await.unwrap();
        });

        let mut recv_buf = [0u8; MAX_DATAGRAM];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(1), client.recv_from(&mut recv_buf))
            .await
            .unwrap()
            .unwrap();
        let reply = SwimMessage::decode(&recv_buf[..n]).unwrap();
        assert_eq!(reply.seq, 2);
        assert!(!reply.ack.unwrap().alive);
    }
}
