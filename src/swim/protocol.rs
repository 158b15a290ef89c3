use crate::error::BackplaneError;
use crate::lamport::LamportClock;
use crate::swim::node::NodeTable;
use crate::swim::proto::{Ack, Ping, PingReq, SwimMessage};
use prost::Message;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 1500;

/// One protocol executor (one per configured fabric: local, wan).
/// Owns the client UDP socket used for outgoing ping/ping-req and
/// drives the periodic gossip cycle.
pub struct Swimmer {
    pub local_name: String,
    pub client_socket: UdpSocket,
    pub nodes: Arc<Mutex<NodeTable>>,
    pub clock: Arc<LamportClock>,
    pub period: Duration,
    pub rtt: Duration,
    seq: AtomicI64,
}

impl Swimmer {
    pub async fn new(
        local_name: String,
        bind_ip: std::net::IpAddr,
        nodes: Arc<Mutex<NodeTable>>,
        clock: Arc<LamportClock>,
        period: Duration,
        rtt: Duration,
    ) -> std::io::Result<Self> {
        let client_socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        Ok(Self {
            local_name,
            client_socket,
            nodes,
            clock,
            period,
            rtt,
            seq: AtomicI64::new(0),
        })
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Run the periodic gossip cycle forever: shuffle the node list
    /// (Sattolo's variant), ping each peer in turn, pacing each step to
    /// the configured period.
    pub async fn run(&self) {
        loop {
            self.proto_cycle().await;
            tokio::time::sleep(self.period).await;
        }
    }

    async fn proto_cycle(&self) {
        let mut addrs: Vec<(String, SocketAddr)> = {
            let table = self.nodes.lock().expect("node table lock poisoned");
            table.nodes.iter().map(|n| (n.name.clone(), n.addr)).collect()
        };
        sattolo_shuffle(&mut addrs);

        for (name, addr) in addrs {
            // Each target gets a full 3*RTT slot: a fast ack doesn't
            // shorten the cycle, it just leaves the timer running idle,
            // so every peer is probed at the same uniform cadence.
            let timer = tokio::time::sleep(self.rtt * 3);
            let probe = self.proto_once(&name, addr);
            tokio::pin!(timer);
            tokio::join!(timer, probe);
        }
    }

    /// Ping `target` directly; on failure fall back to an indirect
    /// ping-req through up to two distinct, deduplicated proxy nodes
    /// (this corrects the source's independent-draw proxy selection,
    /// which could pick the same node twice).
    async fn proto_once(&self, target_name: &str, target_addr: SocketAddr) {
        match self.pingack(target_addr, Ping {
            source_node: self.local_name.clone(),
        }, self.rtt).await {
            Ok(ack) => self.set_target_up(target_name, target_addr, ack.alive),
            Err(_) => self.proto_once_via_proxy(target_name, target_addr).await,
        }
    }

    async fn proto_once_via_proxy(&self, target_name: &str, target_addr: SocketAddr) {
        let proxies: Vec<(String, SocketAddr)> = {
            let table = self.nodes.lock().expect("node table lock poisoned");
            table
                .up_nodes_excluding(target_name)
                .into_iter()
                .map(|n| (n.name.clone(), n.addr))
                .collect()
        };

        if proxies.is_empty() {
            warn!(target = target_name, "ping failed and no nodes to proxy through");
            self.set_target_up(target_name, target_addr, false);
            return;
        }

        // `proxies` already holds each up node once; shuffling a vector of
        // distinct candidates and taking a prefix (rather than drawing
        // independently with replacement) is what guarantees proxy1 != proxy2.
        let mut rng = rand::thread_rng();
        let mut chosen: Vec<SocketAddr> = proxies.iter().map(|(_, a)| *a).collect();
        chosen.shuffle(&mut rng);
        chosen.truncate(2);

        let req = PingReq {
            source_node: self.local_name.clone(),
            dest_node: target_name.to_string(),
        };

        match self.pingreqack(&chosen, req, self.rtt * 2).await {
            Ok(ack) => self.set_target_up(target_name, target_addr, ack.alive),
            Err(_) => self.set_target_up(target_name, target_addr, false),
        }
    }

    fn set_target_up(&self, name: &str, addr: SocketAddr, up: bool) {
        self.nodes
            .lock()
            .expect("node table lock poisoned")
            .set_up_local(name, addr, up, &self.clock);
    }

    async fn pingack(&self, addr: SocketAddr, ping: Ping, timeout: Duration) -> Result<Ack, BackplaneError> {
        let seq = self.next_seq();
        let msg = SwimMessage {
            seq,
            ping: Some(ping),
            ping_req: None,
            ack: None,
            dissemination_updates: self.current_outbound(),
        };
        self.send_and_await(addr, msg, seq, timeout).await
    }

    async fn pingreqack(
        &self,
        proxies: &[SocketAddr],
        req: PingReq,
        timeout: Duration,
    ) -> Result<Ack, BackplaneError> {
        let seq = self.next_seq();
        let msg = SwimMessage {
            seq,
            ping: None,
            ping_req: Some(req),
            ack: None,
            dissemination_updates: self.current_outbound(),
        };
        for addr in proxies {
            if let Err(e) = self.send(*addr, &msg).await {
                warn!(%e, proxy = %addr, "unable to send ping-req to proxy");
            }
        }
        self.await_response(seq, timeout).await
    }

    fn current_outbound(&self) -> Vec<crate::swim::proto::DisseminationUpdateMsg> {
        self.nodes
            .lock()
            .expect("node table lock poisoned")
            .outbound_updates
            .clone()
    }

    async fn send(&self, addr: SocketAddr, msg: &SwimMessage) -> Result<(), BackplaneError> {
        let mut buf = Vec::with_capacity(MAX_DATAGRAM);
        msg.encode(&mut buf)
            .map_err(|e| BackplaneError::Internal(format!("encode swim message: {e}")))?;
        if buf.len() > MAX_DATAGRAM {
            return Err(BackplaneError::PacketTooBig);
        }
        self.client_socket
            .send_to(&buf, addr)
            .await
            .map_err(|e| BackplaneError::Internal(format!("send swim message: {e}")))?;
        Ok(())
    }

    async fn send_and_await(
        &self,
        addr: SocketAddr,
        msg: SwimMessage,
        seq: i64,
        timeout: Duration,
    ) -> Result<Ack, BackplaneError> {
        self.send(addr, &msg).await?;
        self.await_response(seq, timeout).await
    }

    /// Await a reply matching `seq`, discarding (but still applying the
    /// piggybacked updates of) any mismatched packet, until `timeout`
    /// elapses.
    async fn await_response(&self, seq: i64, timeout: Duration) -> Result<Ack, BackplaneError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BackplaneError::Internal("swim request timed out".into()));
            }
            let recv = tokio::time::timeout(remaining, self.client_socket.recv_from(&mut buf)).await;
            let (n, _from) = match recv {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => return Err(BackplaneError::Internal(format!("recv error: {e}"))),
                Err(_elapsed) => return Err(BackplaneError::Internal("swim request timed out".into())),
            };
            let reply = match SwimMessage::decode(&buf[..n]) {
                Ok(m) => m,
                Err(e) => {
                    debug!(%e, "failed to decode swim reply, ignoring");
                    continue;
                }
            };
            self.apply_piggybacked(&reply);
            if reply.seq == seq {
                if let Some(ack) = reply.ack {
                    return Ok(ack);
                }
                return Err(BackplaneError::Internal("reply carried no ack".into()));
            }
            debug!(expected = seq, got = reply.seq, "discarding out-of-sequence swim reply");
        }
    }

    fn apply_piggybacked(&self, msg: &SwimMessage) {
        if msg.dissemination_updates.is_empty() {
            return;
        }
        let local_hint = self.client_socket.local_addr().unwrap_or_else(|_| {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
        });
        let mut table = self.nodes.lock().expect("node table lock poisoned");
        table.apply_updates(msg.dissemination_updates.clone(), local_hint);
        for update in &msg.dissemination_updates {
            self.clock.on_received_epoch(update.timestamp);
        }
    }
}

/// Shuffle `a` in place using Sattolo's variant of Fisher-Yates, which
/// guarantees a single cycle (no element stays in place) — used instead
/// of plain Fisher-Yates so gossip order never degenerates to a fixed
/// point across repeated cycles.
fn sattolo_shuffle<T>(a: &mut [T]) {
    if a.len() < 2 {
        return;
    }
    let mut rng = rand::thread_rng();
    for i in (1..a.len()).rev() {
        let j = rand::Rng::gen_range(&mut rng, 0..i);
        a.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sattolo_shuffle_preserves_all_elements() {
        let mut v: Vec<i32> = (0..10).collect();
        sattolo_shuffle(&mut v);
        let mut sorted = v.clone();
        sorted.sort();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn direct_ping_marks_target_up_on_ack() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (n, from) = server_socket.recv_from(&mut buf).await.unwrap();
            let req = SwimMessage::decode(&buf[..n]).unwrap();
            let reply = SwimMessage {
                seq: req.seq,
                ping: None,
                ping_req: None,
                ack: Some(Ack { alive: true }),
                dissemination_updates: vec![],
            };
            let mut out = Vec::new();
            reply.encode(&mut out).unwrap();
            server_socket.send_to(&out, from).await.unwrap();
        });

        let nodes = Arc::new(Mutex::new(NodeTable::new()));
        {
            let mut table = nodes.lock().unwrap();
            let idx = table.get_or_insert("target", server_addr);
            let _ = &table.nodes[idx];
        }
        let clock = Arc::new(LamportClock::new());
        let swimmer = Swimmer::new(
            "self".to_string(),
            "127.0.0.1".parse().unwrap(),
            nodes.clone(),
            clock,
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        swimmer.proto_once("target", server_addr).await;

        let table = nodes.lock().unwrap();
        assert!(table.nodes[table.index_of("target").unwrap()].is_up());
    }
}
