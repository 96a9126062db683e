//! # Shared Master-Server Library
//!
//! This module contains the data structures, constants, and utilities shared by
//! the master server and the tools that talk to it. It covers the two concerns
//! every participant must agree on:
//!
//! ## Address Primitives
//!
//! Game servers are keyed by their UDP endpoint. The registry hashes endpoints
//! into buckets and compares them with two distinct outcomes: an *exact* match
//! (same endpoint) and a *same public host* match (same IPv4 address, or same
//! IPv6 /64 subnet). The per-address quota counts public hosts, not endpoints,
//! so both results matter and are computed together by [`same_address`].
//!
//! ## Network Protocol
//!
//! The master speaks the classic out-of-band datagram protocol: every message
//! starts with four `0xFF` bytes followed by a command line.
//!
//! - `heartbeat <game>`: a game server announcing itself
//! - `getinfo <challenge>`: the master's reply, asking the server to prove
//!   it owns its address
//! - `infoResponse\n\key\value...`: the server's answer, carrying the
//!   challenge and its current status
//! - `getservers <game> <protocol> [empty] [full]`: a client asking for
//!   the server list
//! - `getserversResponse\<addr>...\EOT`: the master's reply, packing each
//!   IPv4 endpoint into 6 raw bytes
//!
//! Parsing is total: a malformed datagram yields `None` and the caller drops
//! it without replying.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

/// Out-of-band packet prefix shared by every protocol message
pub const OOB_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

/// Default UDP port a master server listens on
pub const DEFAULT_MASTER_PORT: u16 = 27950;

/// Default number of bucket-index bits for the server hash table
pub const DEFAULT_HASH_SIZE: u8 = 4;

/// Upper bound on the bucket-index bit count
pub const MAX_HASH_SIZE: u8 = 12;

/// Default capacity of the server slot array
pub const DEFAULT_MAX_SERVERS: usize = 4096;

/// Default per-public-host registration quota (0 = unlimited)
pub const DEFAULT_MAX_PER_ADDRESS: u32 = 8;

/// Grace period granted to a freshly heartbeated server, in seconds.
/// Gives the getinfo/infoResponse handshake room to complete.
pub const TIMEOUT_HEARTBEAT: u64 = 2;

/// Lifetime of an outstanding challenge, in seconds
pub const TIMEOUT_CHALLENGE: u64 = 2;

/// Lifetime of a fully registered server between heartbeats, in seconds
pub const TIMEOUT_INFORESPONSE: u64 = 15 * 60;

/// Longest accepted game name; anything longer is truncated at registration
pub const GAME_NAME_MAX_LEN: usize = 64;

/// Result of comparing two server addresses
///
/// `exact` means the same endpoint; `same_public` means the same public host
/// (full IPv4 address, or IPv6 /64 subnet). `exact` implies `same_public`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressMatch {
    pub exact: bool,
    pub same_public: bool,
}

/// Computes the bucket index of a server address
///
/// IPv4 hashes the full 32-bit address; IPv6 hashes only the subnet half
/// (first 64 bits) so a multi-homed host lands in one bucket regardless of
/// which of its addresses it talks from. When `hash_ports` is set the port
/// is folded in as well. The result is collapsed to 16 bits and then to the
/// low `hash_size` bits, so it always fits the bucket array.
pub fn address_hash(address: &SocketAddr, hash_size: u8, hash_ports: bool) -> usize {
    let mut hash: u32 = match address {
        SocketAddr::V4(v4) => u32::from_be_bytes(v4.ip().octets()),
        SocketAddr::V6(v6) => {
            let octets = v6.ip().octets();
            let hi = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
            let lo = u32::from_be_bytes([octets[4], octets[5], octets[6], octets[7]]);
            hi ^ lo
        }
    };

    if hash_ports {
        hash ^= u32::from(address.port());
    }

    // Merge all the bits into the first 16 bits
    hash = (hash & 0xFFFF) ^ (hash >> 16);

    // Fold the bits above hash_size into the part we keep
    hash = (hash ^ (hash >> hash_size)) & ((1 << hash_size) - 1);

    hash as usize
}

/// Compares two addresses, reporting both exact and same-public-host matches
///
/// Addresses of different families never match. For IPv6 the public host is
/// the first 64 bits; an exact match additionally requires the host half,
/// the scope id, and the port to agree.
pub fn same_address(a: &SocketAddr, b: &SocketAddr) -> AddressMatch {
    match (a, b) {
        (SocketAddr::V4(a4), SocketAddr::V4(b4)) => {
            let same_public = a4.ip() == b4.ip();
            AddressMatch {
                same_public,
                exact: same_public && a4.port() == b4.port(),
            }
        }
        (SocketAddr::V6(a6), SocketAddr::V6(b6)) => {
            let a_octets = a6.ip().octets();
            let b_octets = b6.ip().octets();
            let same_public = a_octets[..8] == b_octets[..8];
            let exact = same_public
                && a_octets[8..] == b_octets[8..]
                && a6.scope_id() == b6.scope_id()
                && a6.port() == b6.port();
            AddressMatch { same_public, exact }
        }
        _ => AddressMatch::default(),
    }
}

/// Returns true for endpoints on a loopback interface (IPv4 127/8, IPv6 ::1)
pub fn is_loopback(address: &SocketAddr) -> bool {
    match address {
        SocketAddr::V4(v4) => v4.ip().octets()[0] == 127,
        SocketAddr::V6(v6) => *v6.ip() == Ipv6Addr::LOCALHOST,
    }
}

/// Status a game server reports about itself in an infoResponse
///
/// Parsed from the `\key\value` info string. Free-text fields are kept as
/// received; the registry sanitizes them before storing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub challenge: String,
    pub game_name: String,
    pub protocol: i32,
    pub gametype: i32,
    pub map_name: String,
    pub host_name: String,
    pub clients: u32,
    pub max_clients: u32,
}

/// Datagrams a master server receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A game server announcing itself for a given game
    Heartbeat { game: String },
    /// A game server answering a getinfo challenge
    InfoResponse { info: ServerInfo },
    /// A game client asking for the server list
    GetServers {
        game: String,
        protocol: i32,
        empty: bool,
        full: bool,
    },
}

/// Parses an incoming datagram into a [`Request`]
///
/// Returns `None` for anything that is not a well-formed out-of-band message
/// the master understands; such datagrams are dropped without a reply.
pub fn parse_request(datagram: &[u8]) -> Option<Request> {
    let payload = datagram.strip_prefix(&OOB_PREFIX[..])?;
    let text = std::str::from_utf8(payload).ok()?;

    if let Some(rest) = text.strip_prefix("heartbeat") {
        let game = rest.split_whitespace().next()?;
        return Some(Request::Heartbeat {
            game: game.to_string(),
        });
    }

    if let Some(rest) = text.strip_prefix("infoResponse") {
        let info = parse_info_string(rest.trim_start())?;
        return Some(Request::InfoResponse { info });
    }

    if let Some(rest) = text.strip_prefix("getservers ") {
        let mut tokens = rest.split_whitespace();
        let game = tokens.next()?.to_string();
        let protocol: i32 = tokens.next()?.parse().ok()?;
        let mut empty = false;
        let mut full = false;
        for token in tokens {
            match token {
                "empty" => empty = true,
                "full" => full = true,
                _ => {}
            }
        }
        return Some(Request::GetServers {
            game,
            protocol,
            empty,
            full,
        });
    }

    None
}

/// Parses a `\key\value` info string into a [`ServerInfo`]
///
/// Unknown keys are ignored. A dangling key with no value, or a numeric
/// field that does not parse, makes the whole string invalid.
pub fn parse_info_string(s: &str) -> Option<ServerInfo> {
    let mut info = ServerInfo::default();
    let mut tokens = s.split('\\');

    // The leading backslash produces an empty first token
    if !tokens.next()?.is_empty() {
        return None;
    }

    while let Some(key) = tokens.next() {
        let value = tokens.next()?;
        match key {
            "challenge" => info.challenge = value.to_string(),
            "gamename" => info.game_name = value.to_string(),
            "protocol" => info.protocol = value.parse().ok()?,
            "gametype" => info.gametype = value.parse().ok()?,
            "mapname" => info.map_name = value.to_string(),
            "hostname" => info.host_name = value.to_string(),
            "clients" => info.clients = value.parse().ok()?,
            "sv_maxclients" => info.max_clients = value.parse().ok()?,
            _ => {}
        }
    }

    Some(info)
}

/// Builds a heartbeat datagram for a game server to announce itself
pub fn build_heartbeat(game: &str) -> Vec<u8> {
    let mut packet = OOB_PREFIX.to_vec();
    packet.extend_from_slice(b"heartbeat ");
    packet.extend_from_slice(game.as_bytes());
    packet.push(b'\n');
    packet
}

/// Builds the getinfo challenge the master sends back after a heartbeat
pub fn build_getinfo(challenge: &str) -> Vec<u8> {
    let mut packet = OOB_PREFIX.to_vec();
    packet.extend_from_slice(b"getinfo ");
    packet.extend_from_slice(challenge.as_bytes());
    packet
}

/// Builds an infoResponse datagram answering a getinfo challenge
pub fn build_info_response(info: &ServerInfo) -> Vec<u8> {
    let mut packet = OOB_PREFIX.to_vec();
    packet.extend_from_slice(b"infoResponse\n");
    let body = format!(
        "\\challenge\\{}\\gamename\\{}\\protocol\\{}\\gametype\\{}\\mapname\\{}\\hostname\\{}\\clients\\{}\\sv_maxclients\\{}",
        info.challenge,
        info.game_name,
        info.protocol,
        info.gametype,
        info.map_name,
        info.host_name,
        info.clients,
        info.max_clients,
    );
    packet.extend_from_slice(body.as_bytes());
    packet
}

/// Builds a getservers query datagram
pub fn build_getservers(game: &str, protocol: i32, empty: bool, full: bool) -> Vec<u8> {
    let mut packet = OOB_PREFIX.to_vec();
    let mut line = format!("getservers {} {}", game, protocol);
    if empty {
        line.push_str(" empty");
    }
    if full {
        line.push_str(" full");
    }
    packet.extend_from_slice(line.as_bytes());
    packet
}

/// Builds a getserversResponse datagram from a list of published endpoints
///
/// Each endpoint becomes a `\` separator followed by 4 address bytes and a
/// big-endian port; the list ends with `\EOT` and three padding zero bytes.
pub fn build_getservers_response(addrs: &[SocketAddrV4]) -> Vec<u8> {
    let mut packet = OOB_PREFIX.to_vec();
    packet.extend_from_slice(b"getserversResponse");
    for addr in addrs {
        packet.push(b'\\');
        packet.extend_from_slice(&addr.ip().octets());
        packet.extend_from_slice(&addr.port().to_be_bytes());
    }
    packet.extend_from_slice(b"\\EOT\0\0\0");
    packet
}

/// Decodes a getserversResponse datagram back into endpoints
pub fn parse_getservers_response(packet: &[u8]) -> Option<Vec<SocketAddrV4>> {
    let mut rest = packet
        .strip_prefix(&OOB_PREFIX[..])?
        .strip_prefix(b"getserversResponse".as_slice())?;

    let mut addrs = Vec::new();
    while let Some(entry) = rest.strip_prefix(b"\\".as_slice()) {
        if entry.starts_with(b"EOT") {
            return Some(addrs);
        }
        if entry.len() < 6 {
            return None;
        }
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        addrs.push(SocketAddrV4::new(ip, port));
        rest = &entry[6..];
    }

    None
}
