//! Master network layer: the UDP loop owning the registry and the clock

use crate::games::GamePolicy;
use crate::registry::{ServerRegistry, ServerState};
use crate::snapshot;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    build_getinfo, build_getservers_response, parse_request, Request, ServerInfo,
    GAME_NAME_MAX_LEN, TIMEOUT_CHALLENGE, TIMEOUT_INFORESPONSE,
};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// Cap on addresses per getserversResponse, keeping the reply inside one
/// safe UDP payload (7 bytes per entry)
const MAX_SERVERS_PER_RESPONSE: usize = 160;

/// Longest stored free-text field (map name, host name)
const MAX_TEXT_FIELD_LEN: usize = 128;

const CHALLENGE_LEN: usize = 12;
const CHALLENGE_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// What woke the owner loop up
enum Wake {
    Packet(std::io::Result<(usize, SocketAddr)>),
    Snapshot,
}

/// The master server: one task owning the socket, the registry, the game
/// policy, and the monotonic clock
pub struct MasterServer {
    socket: UdpSocket,
    registry: ServerRegistry,
    policy: GamePolicy,
    started: Instant,
    snapshot_path: Option<PathBuf>,
    snapshot_interval: Duration,
    rng: StdRng,
}

impl MasterServer {
    pub async fn new(
        bind_addr: &str,
        registry: ServerRegistry,
        policy: GamePolicy,
        snapshot_path: Option<PathBuf>,
        snapshot_interval: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("Master server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            registry,
            policy,
            started: Instant::now(),
            snapshot_path,
            snapshot_interval,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Runs the receive loop forever
    ///
    /// The clock is advanced before every dispatch, so timeouts are driven
    /// entirely by packet arrival and the snapshot timer.
    pub async fn run(mut self) {
        let mut buffer = [0u8; 2048];
        let mut snapshot_timer = tokio::time::interval(self.snapshot_interval);

        loop {
            let wake = tokio::select! {
                received = self.socket.recv_from(&mut buffer) => Wake::Packet(received),
                _ = snapshot_timer.tick() => Wake::Snapshot,
            };

            self.registry.set_time(self.started.elapsed().as_secs());

            match wake {
                Wake::Packet(Ok((len, from))) => {
                    if let Some(reply) = self.handle_datagram(&buffer[..len], from) {
                        if let Err(e) = self.socket.send_to(&reply, from).await {
                            error!("Failed to send reply to {}: {}", from, e);
                        }
                    }
                }
                Wake::Packet(Err(e)) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Wake::Snapshot => self.write_snapshot(),
            }
        }
    }

    /// Dispatches one datagram, returning the reply to send back, if any
    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let request = match parse_request(data) {
            Some(request) => request,
            None => {
                debug!("> Ignoring malformed datagram from {}", from);
                return None;
            }
        };

        match request {
            Request::Heartbeat { game } => self.handle_heartbeat(from, &game),
            Request::InfoResponse { info } => {
                self.handle_info_response(from, info);
                None
            }
            Request::GetServers {
                game,
                protocol,
                empty,
                full,
            } => Some(self.handle_getservers(from, &game, protocol, empty, full)),
        }
    }

    /// Registers the sender (if allowed) and challenges it with a getinfo
    fn handle_heartbeat(&mut self, from: SocketAddr, game: &str) -> Option<Vec<u8>> {
        debug!("> {} ---> heartbeat ({})", from, game);

        let challenge = new_challenge(&mut self.rng);
        let now = self.registry.time();
        let record = self.registry.get_or_add(from, true)?;
        record.challenge = challenge.clone();
        record.challenge_timeout = now + TIMEOUT_CHALLENGE;

        Some(build_getinfo(&challenge))
    }

    /// Validates a challenge response and fills in the server's record
    fn handle_info_response(&mut self, from: SocketAddr, info: ServerInfo) {
        debug!("> {} ---> infoResponse", from);

        let now = self.registry.time();
        let accepted = self.policy.is_accepted(&info.game_name);

        let record = match self.registry.get_or_add(from, false) {
            Some(record) => record,
            None => {
                warn!("> WARNING: infoResponse from unregistered server {}", from);
                return;
            }
        };

        if info.challenge != record.challenge || record.challenge_timeout < now {
            warn!(
                "> WARNING: infoResponse from {} with mismatched or stale challenge",
                from
            );
            return;
        }
        if info.game_name.is_empty() {
            warn!("> WARNING: infoResponse from {} with no game name", from);
            return;
        }
        if !accepted {
            warn!(
                "> WARNING: server {} isn't allowed (game \"{}\" is not accepted)",
                from, info.game_name
            );
            return;
        }

        record.game_name = clean_field(&info.game_name, GAME_NAME_MAX_LEN);
        record.protocol = info.protocol;
        record.gametype = info.gametype;
        record.map_name = clean_field(&info.map_name, MAX_TEXT_FIELD_LEN);
        record.host_name = clean_field(&info.host_name, MAX_TEXT_FIELD_LEN);
        record.state = if info.clients == 0 {
            ServerState::Empty
        } else if info.max_clients != 0 && info.clients >= info.max_clients {
            ServerState::Full
        } else {
            ServerState::Occupied
        };
        record.timeout = now + TIMEOUT_INFORESPONSE;

        info!(
            "> Server {} is now registered: game \"{}\", protocol {}",
            from, record.game_name, record.protocol
        );
    }

    /// Builds a getserversResponse for one randomised pass over the registry
    fn handle_getservers(
        &mut self,
        from: SocketAddr,
        game: &str,
        protocol: i32,
        want_empty: bool,
        want_full: bool,
    ) -> Vec<u8> {
        info!("> {} ---> getservers ({}, protocol {})", from, game, protocol);

        let mut addrs: Vec<SocketAddrV4> = Vec::new();
        let mut cursor = self.registry.get_first();
        while let Some(index) = cursor {
            if addrs.len() >= MAX_SERVERS_PER_RESPONSE {
                break;
            }
            if let Some(record) = self.registry.server(index) {
                if record.state > ServerState::Uninitialized
                    && record.game_name == game
                    && record.protocol == protocol
                    && (want_empty || record.state != ServerState::Empty)
                    && (want_full || record.state != ServerState::Full)
                {
                    // Only IPv4 endpoints fit the response format
                    if let SocketAddr::V4(v4) = self.registry.published_address(record) {
                        addrs.push(v4);
                    }
                }
            }
            cursor = self.registry.get_next();
        }

        debug!("> Sending {} server(s) to {}", addrs.len(), from);
        build_getservers_response(&addrs)
    }

    fn write_snapshot(&self) {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return,
        };
        match snapshot::write_info_file(&self.registry, path) {
            Ok(()) => debug!("> Server snapshot written to {}", path.display()),
            Err(e) => error!(
                "> ERROR: can't write server snapshot to {}: {}",
                path.display(),
                e
            ),
        }
    }
}

fn new_challenge(rng: &mut StdRng) -> String {
    (0..CHALLENGE_LEN)
        .map(|_| CHALLENGE_CHARSET[rng.gen_range(0..CHALLENGE_CHARSET.len())] as char)
        .collect()
}

/// Strips the separators the snapshot format cannot carry and caps length
fn clean_field(value: &str, max_len: usize) -> String {
    value
        .chars()
        .filter(|&c| c != ',' && c != '\n' && c != '\r')
        .take(max_len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrmap::AddrMapTable;
    use crate::registry::RegistryConfig;
    use shared::{build_heartbeat, build_info_response, parse_getservers_response, OOB_PREFIX};

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    async fn master() -> MasterServer {
        let config = RegistryConfig {
            max_servers: 16,
            max_per_address: 0,
            rng_seed: Some(7),
            ..Default::default()
        };
        let registry = ServerRegistry::new(config, AddrMapTable::new()).unwrap();
        MasterServer::new(
            "127.0.0.1:0",
            registry,
            GamePolicy::new(),
            None,
            Duration::from_secs(300),
        )
        .await
        .unwrap()
    }

    fn challenge_of(getinfo: &[u8]) -> String {
        let text = std::str::from_utf8(&getinfo[OOB_PREFIX.len()..]).unwrap();
        text.strip_prefix("getinfo ").unwrap().to_string()
    }

    fn register(master: &mut MasterServer, addr: SocketAddr, game: &str, clients: u32) {
        let reply = master
            .handle_datagram(&build_heartbeat(game), addr)
            .expect("heartbeat should be answered");
        let info = ServerInfo {
            challenge: challenge_of(&reply),
            game_name: game.to_string(),
            protocol: 68,
            gametype: 4,
            map_name: "q3dm17".to_string(),
            host_name: "test server".to_string(),
            clients,
            max_clients: 16,
        };
        assert!(master
            .handle_datagram(&build_info_response(&info), addr)
            .is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered_with_getinfo() {
        let mut master = master().await;
        let addr = v4("10.0.0.1:27960");

        let reply = master
            .handle_datagram(&build_heartbeat("quake3"), addr)
            .unwrap();
        let challenge = challenge_of(&reply);
        assert_eq!(challenge.len(), CHALLENGE_LEN);

        let record = master.registry().server(0).unwrap();
        assert_eq!(record.address, addr);
        assert_eq!(record.challenge, challenge);
        assert_eq!(record.state, ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_info_response_completes_registration() {
        let mut master = master().await;
        let addr = v4("10.0.0.1:27960");

        register(&mut master, addr, "quake3", 3);

        let record = master.registry().server(0).unwrap();
        assert_eq!(record.state, ServerState::Occupied);
        assert_eq!(record.game_name, "quake3");
        assert_eq!(record.protocol, 68);
        assert_eq!(record.timeout, TIMEOUT_INFORESPONSE);
    }

    #[tokio::test]
    async fn test_info_response_with_wrong_challenge_is_ignored() {
        let mut master = master().await;
        let addr = v4("10.0.0.1:27960");

        master
            .handle_datagram(&build_heartbeat("quake3"), addr)
            .unwrap();

        let info = ServerInfo {
            challenge: "forged".to_string(),
            game_name: "quake3".to_string(),
            protocol: 68,
            clients: 1,
            max_clients: 16,
            ..Default::default()
        };
        assert!(master
            .handle_datagram(&build_info_response(&info), addr)
            .is_none());

        let record = master.registry().server(0).unwrap();
        assert_eq!(record.state, ServerState::Uninitialized);
        assert!(record.game_name.is_empty());
    }

    #[tokio::test]
    async fn test_info_response_from_unknown_sender_is_ignored() {
        let mut master = master().await;
        let info = ServerInfo {
            challenge: "whatever".to_string(),
            game_name: "quake3".to_string(),
            ..Default::default()
        };
        assert!(master
            .handle_datagram(&build_info_response(&info), v4("10.0.0.1:27960"))
            .is_none());
        assert!(master.registry().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_game_is_not_registered() {
        let config = RegistryConfig {
            max_servers: 16,
            max_per_address: 0,
            rng_seed: Some(7),
            ..Default::default()
        };
        let registry = ServerRegistry::new(config, AddrMapTable::new()).unwrap();
        let mut policy = GamePolicy::new();
        policy
            .declare(
                crate::games::PolicyMode::Reject,
                &["doom".to_string()],
            )
            .unwrap();
        let mut master = MasterServer::new(
            "127.0.0.1:0",
            registry,
            policy,
            None,
            Duration::from_secs(300),
        )
        .await
        .unwrap();

        let addr = v4("10.0.0.1:27960");
        let reply = master
            .handle_datagram(&build_heartbeat("doom"), addr)
            .unwrap();
        let info = ServerInfo {
            challenge: challenge_of(&reply),
            game_name: "doom".to_string(),
            protocol: 3,
            clients: 1,
            max_clients: 8,
            ..Default::default()
        };
        assert!(master
            .handle_datagram(&build_info_response(&info), addr)
            .is_none());

        // The record exists but never left the uninitialized state
        let record = master.registry().server(0).unwrap();
        assert_eq!(record.state, ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_getservers_filters_game_and_state() {
        let mut master = master().await;

        register(&mut master, v4("10.0.0.1:27960"), "quake3", 3);
        register(&mut master, v4("10.0.0.2:27960"), "quake3", 0);
        register(&mut master, v4("10.0.0.3:27960"), "warsow", 5);

        let reply = master
            .handle_datagram(
                &shared::build_getservers("quake3", 68, false, true),
                v4("192.0.2.1:40000"),
            )
            .unwrap();
        let addrs = parse_getservers_response(&reply).unwrap();

        // The empty quake3 server and the warsow server are filtered out
        assert_eq!(addrs, vec!["10.0.0.1:27960".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_getservers_includes_empty_when_asked() {
        let mut master = master().await;

        register(&mut master, v4("10.0.0.1:27960"), "quake3", 3);
        register(&mut master, v4("10.0.0.2:27960"), "quake3", 0);

        let reply = master
            .handle_datagram(
                &shared::build_getservers("quake3", 68, true, true),
                v4("192.0.2.1:40000"),
            )
            .unwrap();
        let mut addrs = parse_getservers_response(&reply).unwrap();
        addrs.sort();

        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let mut master = master().await;
        assert!(master
            .handle_datagram(b"not a protocol message", v4("10.0.0.1:1"))
            .is_none());
        assert!(master
            .handle_datagram(b"\xFF\xFF\xFF\xFFnonsense", v4("10.0.0.1:1"))
            .is_none());
        assert!(master.registry().is_empty());
    }
}
