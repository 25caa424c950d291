//! UDP rendezvous server: receive loop and protocol dispatch

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use rendezvous_core::{PeerAddress, RoomConfig, MAX_DATAGRAM_SIZE};

use crate::events::{Events, ServerEvent};
use crate::messages::{Envelope, Protocol, TYPE_CONNECT, TYPE_CREATE, TYPE_INFO};
use crate::relay::{RelayForwarder, RelayRejected};
use crate::room::RoomManager;
use crate::storage::RoomStore;
use crate::transport::Transport;

/// Signal server state
///
/// Cheap to clone; every clone shares the same transport and store.
#[derive(Clone)]
pub struct SignalServer {
    transport: Arc<dyn Transport>,
    store: Arc<dyn RoomStore>,
    rooms: Arc<RoomManager>,
    relay: Arc<RelayForwarder>,
    events: Events,
    purge_interval: Duration,
}

impl SignalServer {
    /// Build a server over an existing transport and store
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn RoomStore>,
        config: &RoomConfig,
    ) -> Self {
        let events = Events::new();
        let rooms = Arc::new(RoomManager::new(
            store.clone(),
            config.idle_timeout(),
            events.clone(),
        ));
        let relay = Arc::new(RelayForwarder::new(rooms.clone()));

        Self {
            transport,
            store,
            rooms,
            relay,
            events,
            purge_interval: config.purge_interval(),
        }
    }

    /// Bind a UDP socket and build a server on it
    pub async fn bind(
        addr: SocketAddr,
        store: Arc<dyn RoomStore>,
        config: &RoomConfig,
    ) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Signal server listening on {}", socket.local_addr()?);
        Ok(Self::new(Arc::new(socket), store, config))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.transport.local_addr()
    }

    /// Observe dropped datagrams and other silent failures
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Live room count (for monitoring)
    pub async fn room_count(&self) -> usize {
        self.store.room_count().await.unwrap_or(0)
    }

    /// Receive and handle datagrams until `shutdown` flips to true or its
    /// sender is dropped.
    ///
    /// Each datagram is handled in its own task, so a slow store call only
    /// holds up the datagram that issued it.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), std::io::Error> {
        let purge = tokio::spawn(purge_expired_rooms(
            self.store.clone(),
            self.events.clone(),
            self.purge_interval,
        ));

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.transport.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            let datagram = buf[..len].to_vec();
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_datagram(&datagram, source).await;
                            });
                        }
                        // ICMP unreachable from an earlier send can surface
                        // here; the socket stays usable.
                        Err(e) => warn!("Receive error: {}", e),
                    }
                }
            }
        }

        purge.abort();
        info!("Signal server stopped");
        Ok(())
    }

    /// Decode and dispatch one datagram
    pub async fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) {
        match Envelope::decode(datagram) {
            Ok(envelope) => self.dispatch(envelope, PeerAddress::from(source)).await,
            Err(e) => {
                debug!("Dropping undecodable datagram from {}: {}", source, e);
                self.events.emit(ServerEvent::DecodeFailed {
                    from: source,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Route an envelope by protocol and type; anything unrecognised is ignored
    pub async fn dispatch(&self, envelope: Envelope, source: PeerAddress) {
        match (envelope.protocol, envelope.kind.as_str()) {
            (Protocol::Api, TYPE_CREATE | TYPE_CONNECT) => {
                self.handle_register(envelope, source).await
            }
            (Protocol::Api, TYPE_INFO) => self.handle_info(envelope, source).await,
            (Protocol::Relay, _) if envelope.id.is_some() && envelope.to.is_some() => {
                self.handle_relay(envelope, source).await
            }
            (protocol, kind) => {
                trace!("Ignoring {:?}/{:?} from {}", protocol, kind, source);
            }
        }
    }

    async fn handle_register(&self, envelope: Envelope, source: PeerAddress) {
        let registered = self
            .rooms
            .register(envelope.id.as_deref(), source, envelope.port)
            .await;

        match registered {
            // Joining peers get the member list straight away
            Ok(room_id) if envelope.id.is_some() => {
                self.send_room_info(room_id, source, envelope.port, &envelope.seq)
                    .await
            }
            Ok(room_id) => {
                self.reply(Envelope::create_response(room_id), &envelope.seq, source)
                    .await
            }
            Err(e) => {
                warn!("Registration from {} failed: {}", source, e);
                self.events.emit(ServerEvent::RegisterFailed {
                    from: source,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn handle_info(&self, envelope: Envelope, source: PeerAddress) {
        let Some(room_id) = envelope.id else {
            trace!("Ignoring info without room id from {}", source);
            return;
        };
        self.send_room_info(room_id, source, envelope.port, &envelope.seq)
            .await;
    }

    async fn send_room_info(
        &self,
        room_id: String,
        source: PeerAddress,
        declared_port: Option<u16>,
        seq: &Value,
    ) {
        let reply = match self.rooms.query(&room_id, source, declared_port).await {
            Ok(members) => Envelope::info(room_id, members),
            Err(e) => Envelope::error(room_id, e.reason()),
        };
        self.reply(reply, seq, source).await;
    }

    async fn handle_relay(&self, envelope: Envelope, source: PeerAddress) {
        match self.relay.relay(envelope, source).await {
            Ok(forward) => self.send(&forward.envelope, forward.to).await,
            Err(RelayRejected::NotAMember { room_id, to })
            | Err(RelayRejected::UnknownRoom { room_id, to }) => {
                self.events.emit(ServerEvent::RelayRejected {
                    room_id,
                    from: source,
                    to,
                });
            }
            Err(RelayRejected::Incomplete) => {}
        }
    }

    /// Send a reply carrying the request's `seq`
    async fn reply(&self, envelope: Envelope, seq: &Value, to: PeerAddress) {
        self.send(&envelope.with_seq(seq), to).await;
    }

    async fn send(&self, envelope: &Envelope, to: PeerAddress) {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", envelope.kind, to, e);
                self.events.emit(ServerEvent::EncodeFailed {
                    to,
                    error: e.to_string(),
                });
                return;
            }
        };

        if let Err(e) = self.transport.send_to(&bytes, to.socket_addr()).await {
            debug!("Send to {} failed: {}", to, e);
            self.events.emit(ServerEvent::SendFailed {
                to,
                error: e.to_string(),
            });
        }
    }
}

/// Periodically reclaim expired rooms
async fn purge_expired_rooms(store: Arc<dyn RoomStore>, events: Events, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(count) => {
                info!("Removed {} idle rooms from {} store", count, store.name());
                events.emit(ServerEvent::RoomsPurged { count });
            }
            Err(e) => warn!("Room purge failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::testing::RecordingTransport;
    use serde_json::json;

    const X: &str = "198.51.100.1:40001";
    const Y: &str = "203.0.113.7:50002";

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn server() -> (SignalServer, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let server = SignalServer::new(
            transport.clone(),
            Arc::new(MemoryStore::new()),
            &RoomConfig::default(),
        );
        (server, transport)
    }

    async fn request(server: &SignalServer, from: &str, body: Value) {
        server
            .handle_datagram(body.to_string().as_bytes(), sock(from))
            .await;
    }

    /// The single datagram sent since the last call, as JSON
    fn only_sent(transport: &RecordingTransport) -> (Value, SocketAddr) {
        let mut sent = transport.take_sent();
        assert_eq!(sent.len(), 1, "expected exactly one datagram");
        let (bytes, to) = sent.remove(0);
        (serde_json::from_slice(&bytes).unwrap(), to)
    }

    fn member(s: &str) -> Value {
        let addr = sock(s);
        json!({"ip": addr.ip().to_string(), "family": "IPv4", "port": addr.port()})
    }

    #[tokio::test]
    async fn test_create_connect_info_scenario() {
        let (server, transport) = server();

        request(&server, X, json!({"protocol":"api","type":"create","seq":1})).await;
        let (reply, to) = only_sent(&transport);
        assert_eq!(to, sock(X));
        assert_eq!(reply["type"], "create-response");
        assert_eq!(reply["protocol"], "api");
        assert_eq!(reply["seq"], 1);
        let id = reply["id"].as_str().unwrap().to_owned();

        request(&server, Y, json!({"protocol":"api","type":"connect","id":id,"seq":1})).await;
        let (reply, to) = only_sent(&transport);
        assert_eq!(to, sock(Y));
        assert_eq!(reply["type"], "info");
        assert_eq!(reply["id"], id.as_str());
        assert_eq!(reply["seq"], 1);
        assert_eq!(reply["members"], json!([member(X)]));

        request(&server, X, json!({"protocol":"api","type":"info","id":id,"seq":2})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["seq"], 2);
        assert_eq!(reply["members"], json!([member(Y)]));

        assert_eq!(server.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_relay_scenario() {
        let (server, transport) = server();

        request(&server, X, json!({"protocol":"api","type":"create","seq":1})).await;
        let id = only_sent(&transport).0["id"].as_str().unwrap().to_owned();
        request(&server, Y, json!({"protocol":"api","type":"connect","id":id,"seq":1})).await;
        transport.take_sent();

        request(
            &server,
            Y,
            json!({
                "protocol": "relay",
                "type": "offer",
                "id": id,
                "seq": 9,
                "to": {"ip": "198.51.100.1", "port": 40001},
                "from": {"ip": "10.6.6.6", "port": 666},
                "sdp": "v=0"
            }),
        )
        .await;

        let (forwarded, to) = only_sent(&transport);
        assert_eq!(to, sock(X));
        assert_eq!(forwarded["protocol"], "relay");
        assert_eq!(forwarded["type"], "offer");
        assert_eq!(forwarded["seq"], 9);
        assert_eq!(forwarded["from"], member(Y));
        assert_eq!(forwarded["sdp"], "v=0");
    }

    #[tokio::test]
    async fn test_relay_to_stranger_is_silent() {
        let (server, transport) = server();
        let mut events = server.subscribe();

        request(&server, X, json!({"type":"create","seq":1})).await;
        let id = only_sent(&transport).0["id"].as_str().unwrap().to_owned();

        request(
            &server,
            X,
            json!({"protocol":"relay","type":"x","id":id,"to":{"ip":"192.0.2.99","port":53}}),
        )
        .await;
        assert_eq!(transport.sent_count(), 0);
        assert!(matches!(
            events.try_recv(),
            Ok(ServerEvent::RelayRejected { room_id, .. }) if room_id == id
        ));

        // Unknown rooms are just as quiet
        request(
            &server,
            X,
            json!({"protocol":"relay","type":"x","id":"nope","to":{"ip":"192.0.2.99","port":53}}),
        )
        .await;
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_info_for_missing_room() {
        let (server, transport) = server();

        request(&server, X, json!({"protocol":"api","type":"info","id":"gone","seq":"abc"})).await;
        let (reply, to) = only_sent(&transport);
        assert_eq!(to, sock(X));
        assert_eq!(
            reply,
            json!({"protocol":"api","type":"error","seq":"abc","id":"gone","reason":"no such room"})
        );
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let (server, transport) = server();
        let mut events = server.subscribe();

        server.handle_datagram(b"\xc1garbage", sock(X)).await;

        assert_eq!(transport.sent_count(), 0);
        assert!(matches!(
            events.try_recv(),
            Ok(ServerEvent::DecodeFailed { from, .. }) if from == sock(X)
        ));
    }

    #[tokio::test]
    async fn test_unrouted_envelopes_are_ignored() {
        let (server, transport) = server();

        request(&server, X, json!({"protocol":"api","type":"create-response","seq":1})).await;
        request(&server, X, json!({"protocol":"mesh","type":"create","seq":1})).await;
        request(&server, X, json!({"protocol":"relay","type":"x","id":"room"})).await;
        request(&server, X, json!({"protocol":"api","type":"info","seq":1})).await;

        assert_eq!(transport.sent_count(), 0);
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_room_id_means_no_room_id() {
        let (server, transport) = server();

        request(&server, X, json!({"type":"create","id":"","seq":1})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["type"], "create-response");
        let id = reply["id"].as_str().unwrap();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        request(&server, Y, json!({"type":"info","id":"","seq":2})).await;
        request(&server, Y, json!({"protocol":"relay","type":"x","id":"","to":member(X)})).await;
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(server.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_unbounded_idle_timeout_still_registers() {
        let transport = Arc::new(RecordingTransport::new());
        let config = RoomConfig {
            idle_timeout_secs: u64::MAX,
            ..RoomConfig::default()
        };
        let server = SignalServer::new(transport.clone(), Arc::new(MemoryStore::new()), &config);

        request(&server, X, json!({"type":"create","seq":1})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["type"], "create-response");
        let id = reply["id"].as_str().unwrap().to_owned();

        request(&server, Y, json!({"type":"connect","id":id,"seq":2})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["members"], json!([member(X)]));
    }

    #[tokio::test]
    async fn test_join_with_declared_port_hides_own_entries() {
        let (server, transport) = server();

        request(&server, X, json!({"type":"create","seq":1})).await;
        let id = only_sent(&transport).0["id"].as_str().unwrap().to_owned();

        request(&server, Y, json!({"type":"connect","id":id,"port":50003,"seq":2})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["members"], json!([member(X)]));

        request(&server, X, json!({"type":"info","id":id,"seq":3})).await;
        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["members"], json!([member(Y), member("203.0.113.7:50003")]));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let (server, transport) = server();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let running = tokio::spawn({
            let server = server.clone();
            async move { server.serve(shutdown_rx).await }
        });

        transport.push(br#"{"protocol":"api","type":"create","seq":7}"#, sock(X));
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.sent_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (reply, _) = only_sent(&transport);
        assert_eq!(reply["type"], "create-response");
        assert_eq!(reply["seq"], 7);

        shutdown_tx.send(true).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let server = SignalServer::bind(
            sock("127.0.0.1:0"),
            Arc::new(MemoryStore::new()),
            &RoomConfig::default(),
        )
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn({
            let server = server.clone();
            async move { server.serve(shutdown_rx).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(br#"{"protocol":"api","type":"create","seq":"r1"}"#, server_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server_addr);

        let reply: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(reply["type"], "create-response");
        assert_eq!(reply["seq"], "r1");

        drop(shutdown_tx);
        running.await.unwrap().unwrap();
    }
}
