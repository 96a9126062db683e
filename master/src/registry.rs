//! Server registry: the address-indexed table of live game servers
//!
//! This module is the heart of the master server. It manages:
//! - A fixed-capacity slot array of server records, allocated once and never
//!   shrunk; a free slot is simply `None`
//! - Two hash-bucket arrays (IPv4 and IPv6) chaining into the slot array
//!   through index-based intrusive links, so unlinking a record is O(1)
//! - Lazy timeout eviction: expired records are removed whenever an activity
//!   check touches them, never by a background task
//! - Randomised, mutation-tolerant iteration for building server-list replies
//!
//! Registrations almost always arrive as a heartbeat followed within
//! milliseconds by an infoResponse from the same endpoint, so every
//! successful lookup promotes the matched record to the head of its bucket.
//!
//! The registry is single-threaded and cooperative: one owner drives the
//! clock, dispatches packets, and walks iterators. Nothing here blocks.

use crate::addrmap::AddrMapTable;
use crate::error::MasterError;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    is_loopback, same_address, DEFAULT_HASH_SIZE, DEFAULT_MAX_PER_ADDRESS, DEFAULT_MAX_SERVERS,
    MAX_HASH_SIZE, TIMEOUT_HEARTBEAT,
};
use std::net::SocketAddr;

/// Lifecycle state of a registered server, in increasing order of knowledge
///
/// A freshly heartbeated server is `Uninitialized` until its infoResponse
/// arrives; after that the state tracks how many players it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Uninitialized,
    Empty,
    Occupied,
    Full,
}

impl ServerState {
    /// The state word used by the snapshot file format
    pub fn info_word(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "notInitialized",
            ServerState::Empty => "empty",
            ServerState::Occupied => "occupied",
            ServerState::Full => "full",
        }
    }
}

/// One registered game server
///
/// `addrmap` is an index into the registry's mapping table; mappings are
/// immutable once resolved, so the index stays valid for the record's life.
/// The `next`/`prev` links chain the record into its hash bucket.
#[derive(Debug)]
pub struct ServerRecord {
    pub address: SocketAddr,
    pub state: ServerState,
    /// Absolute tick after which the record is evicted
    pub timeout: u64,
    pub game_name: String,
    pub protocol: i32,
    pub gametype: i32,
    pub map_name: String,
    pub host_name: String,
    pub challenge: String,
    pub challenge_timeout: u64,
    pub addrmap: Option<usize>,
    next: Option<usize>,
    prev: Option<usize>,
}

/// Registry knobs, frozen when the registry is constructed
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bits of bucket index (1 to [`MAX_HASH_SIZE`])
    pub hash_size: u8,
    /// Capacity of the slot array
    pub max_servers: usize,
    /// Per-public-host registration quota; 0 means unlimited
    pub max_per_address: u32,
    /// Whether ports participate in bucket selection
    pub hash_ports: bool,
    /// Whether loopback endpoints may register
    pub allow_loopback: bool,
    /// Seed for the iteration RNG; `None` seeds from entropy
    pub rng_seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            hash_size: DEFAULT_HASH_SIZE,
            max_servers: DEFAULT_MAX_SERVERS,
            max_per_address: DEFAULT_MAX_PER_ADDRESS,
            hash_ports: false,
            allow_loopback: true,
            rng_seed: None,
        }
    }
}

/// The server registry: slot array, dual hash index, and address mappings
pub struct ServerRegistry {
    servers: Vec<Option<ServerRecord>>,
    ipv4_buckets: Vec<Option<usize>>,
    ipv6_buckets: Vec<Option<usize>>,
    addrmaps: AddrMapTable,

    hash_size: u8,
    hash_ports: bool,
    max_per_address: u32,
    allow_loopback: bool,

    nb_servers: usize,
    /// Highest occupied slot index
    last_used_slot: Option<usize>,
    /// Lowest free slot index; `None` when the array is full
    first_free_slot: Option<usize>,

    // Iteration cursor; kept valid across evictions by clamping in remove()
    crt_slot: Option<usize>,
    last_iter_slot: Option<usize>,

    /// Monotonic tick written by the owner loop, in seconds
    now: u64,
    rng: StdRng,
}

impl ServerRegistry {
    /// Builds a registry from a frozen configuration and a resolved mapping
    /// table. Fails on out-of-range knobs; the combination of `hash_ports`
    /// with a nonzero quota is refused because the quota is counted per
    /// bucket and ports would scatter one host over several buckets.
    pub fn new(config: RegistryConfig, addrmaps: AddrMapTable) -> Result<Self, MasterError> {
        if config.hash_size == 0 || config.hash_size > MAX_HASH_SIZE {
            return Err(MasterError::InvalidOptParams(format!(
                "hash size {} is out of range (1-{})",
                config.hash_size, MAX_HASH_SIZE
            )));
        }
        if config.max_servers == 0 {
            return Err(MasterError::InvalidOptParams(
                "at least one server slot is required".to_string(),
            ));
        }
        if config.hash_ports && config.max_per_address != 0 {
            return Err(MasterError::InvalidOptParams(
                "hashing ports is incompatible with a per-address quota".to_string(),
            ));
        }

        let mut servers = Vec::new();
        servers.resize_with(config.max_servers, || None);

        let bucket_count = 1usize << config.hash_size;
        debug!("> IPv4 hash table allocated ({} entries)", bucket_count);
        debug!("> IPv6 hash table allocated ({} entries)", bucket_count);

        if config.max_per_address == 0 {
            info!(
                "> {} server records allocated (maximum number per address: unlimited)",
                config.max_servers
            );
        } else {
            info!(
                "> {} server records allocated (maximum number per address: {})",
                config.max_servers, config.max_per_address
            );
        }

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            servers,
            ipv4_buckets: vec![None; bucket_count],
            ipv6_buckets: vec![None; bucket_count],
            addrmaps,
            hash_size: config.hash_size,
            hash_ports: config.hash_ports,
            max_per_address: config.max_per_address,
            allow_loopback: config.allow_loopback,
            nb_servers: 0,
            last_used_slot: None,
            first_free_slot: Some(0),
            crt_slot: None,
            last_iter_slot: None,
            now: 0,
            rng,
        })
    }

    /// Advances the registry clock. Called by the owner loop before each
    /// packet batch; the registry itself never mutates it.
    pub fn set_time(&mut self, now: u64) {
        self.now = now;
    }

    pub fn time(&self) -> u64 {
        self.now
    }

    /// Number of currently registered servers
    pub fn len(&self) -> usize {
        self.nb_servers
    }

    pub fn is_empty(&self) -> bool {
        self.nb_servers == 0
    }

    pub fn capacity(&self) -> usize {
        self.servers.len()
    }

    pub fn addrmaps(&self) -> &AddrMapTable {
        &self.addrmaps
    }

    pub fn server(&self, index: usize) -> Option<&ServerRecord> {
        self.servers.get(index).and_then(|slot| slot.as_ref())
    }

    pub fn server_mut(&mut self, index: usize) -> Option<&mut ServerRecord> {
        self.servers.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// Looks up a server by address, registering it when `add_if_missing`
    ///
    /// A successful lookup promotes the record to the head of its bucket.
    /// Registration enforces, in order: the per-address quota, the loopback
    /// policy (an IPv4 loopback with an address mapping is allowed), and the
    /// capacity limit, trying a full timeout sweep before giving up.
    /// Refusals are logged as warnings and reported as `None`; the caller
    /// drops the packet and the registry keeps running.
    pub fn get_or_add(
        &mut self,
        address: SocketAddr,
        add_if_missing: bool,
    ) -> Option<&mut ServerRecord> {
        let mut same_public_count: u32 = 0;
        if let Some(index) = self.find(&address, &mut same_public_count) {
            return self.servers[index].as_mut();
        }

        if !add_if_missing {
            return None;
        }

        if self.max_per_address != 0 && same_public_count >= self.max_per_address {
            warn!(
                "> WARNING: server {} isn't allowed (max number of servers reached for this address)",
                address
            );
            return None;
        }

        // IPv4 records carry their mapping so publication can rewrite them
        let addrmap = match &address {
            SocketAddr::V4(v4) => self.addrmaps.lookup(*v4.ip(), v4.port()),
            SocketAddr::V6(_) => None,
        };

        if !self.allow_loopback && is_loopback(&address) {
            // An IPv4 loopback with a mapping is how a server colocated with
            // the master publishes its public address
            let mapped_v4 = matches!(address, SocketAddr::V4(_)) && addrmap.is_some();
            if !mapped_v4 {
                warn!(
                    "> WARNING: server {} isn't allowed (loopback address without address mapping)",
                    address
                );
                return None;
            }
        }

        // If the list is full, see whether a sweep can free a slot
        if self.nb_servers == self.servers.len() {
            self.sweep();
            if self.nb_servers == self.servers.len() {
                warn!(
                    "> WARNING: can't add server {} (server list is full)",
                    address
                );
                return None;
            }
        }

        let slot = match self.first_free_slot {
            Some(slot) => slot,
            None => return None,
        };

        self.servers[slot] = Some(ServerRecord {
            address,
            state: ServerState::Uninitialized,
            timeout: self.now + TIMEOUT_HEARTBEAT,
            game_name: String::new(),
            protocol: 0,
            gametype: 0,
            map_name: String::new(),
            host_name: String::new(),
            challenge: String::new(),
            challenge_timeout: 0,
            addrmap,
            next: None,
            prev: None,
        });
        self.link_head(slot, address);
        if self.last_used_slot.map_or(true, |last| last < slot) {
            self.last_used_slot = Some(slot);
        }
        self.nb_servers += 1;

        // Look for the next free slot. The activity check may evict expired
        // records along the way, which keeps first_free_slot the minimum.
        self.first_free_slot = None;
        let mut index = slot + 1;
        while index < self.servers.len() {
            if !self.is_active(index) {
                self.first_free_slot = Some(index);
                break;
            }
            index += 1;
        }

        info!(
            "> New server added: {}. {} server(s) now registered, including {} for this address quota",
            address,
            self.nb_servers,
            same_public_count + 1
        );
        debug!("  - index: {}", slot);
        debug!("  - hash: 0x{:04X}", self.hash(&address));

        self.servers[slot].as_mut()
    }

    /// Starts a randomised pass over the active servers
    ///
    /// The start slot is drawn at random so that clients which only receive
    /// a truncated server list still see every server eventually.
    pub fn get_first(&mut self) -> Option<usize> {
        if self.nb_servers == 0 {
            return None;
        }
        let last = self.last_used_slot?;

        let start = self.rng.gen_range(0..=last);
        self.crt_slot = Some(start);
        self.last_iter_slot = Some(if start == 0 { last } else { start - 1 });

        if self.is_active(start) {
            return Some(start);
        }
        self.get_next()
    }

    /// Returns the next active server of the current pass, or `None` when
    /// the pass is complete. Evictions during the pass are tolerated: the
    /// cursor is clamped whenever a removal shrinks the used range.
    pub fn get_next(&mut self) -> Option<usize> {
        loop {
            let crt = self.crt_slot?;
            let last_iter = self.last_iter_slot?;
            if crt == last_iter {
                return None;
            }
            let last = self.last_used_slot?;

            let next = (crt + 1) % (last + 1);
            self.crt_slot = Some(next);
            if self.is_active(next) {
                return Some(next);
            }
        }
    }

    /// Evicts every server whose timeout has passed
    pub fn sweep(&mut self) {
        if let Some(last) = self.last_used_slot {
            for index in 0..=last {
                self.is_active(index);
            }
        }
    }

    /// The active servers, oldest slot first, without evicting anything.
    /// Used by the snapshot writer, which must not mutate the registry.
    pub fn active_servers(&self) -> impl Iterator<Item = &ServerRecord> + '_ {
        let end = self.last_used_slot.map_or(0, |last| last + 1);
        let now = self.now;
        self.servers[..end]
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(move |record| record.timeout >= now)
    }

    /// The address a record is published under: its mapping's destination
    /// when one exists, its own endpoint otherwise
    pub fn published_address(&self, record: &ServerRecord) -> SocketAddr {
        if let (Some(index), SocketAddr::V4(v4)) = (record.addrmap, &record.address) {
            if let Some(map) = self.addrmaps.get(index) {
                return SocketAddr::V4(map.rewrite(v4.port()));
            }
        }
        record.address
    }

    /// Diagnostics: the addresses chained in the bucket this address hashes
    /// to, head first
    pub fn bucket_peers(&self, address: &SocketAddr) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        let mut cursor = self.bucket_head(address);
        while let Some(index) = cursor {
            match self.servers[index].as_ref() {
                Some(record) => {
                    peers.push(record.address);
                    cursor = record.next;
                }
                None => break,
            }
        }
        peers
    }

    fn hash(&self, address: &SocketAddr) -> usize {
        shared::address_hash(address, self.hash_size, self.hash_ports)
    }

    fn bucket_head(&self, address: &SocketAddr) -> Option<usize> {
        let hash = self.hash(address);
        match address {
            SocketAddr::V4(_) => self.ipv4_buckets[hash],
            SocketAddr::V6(_) => self.ipv6_buckets[hash],
        }
    }

    fn set_bucket_head(&mut self, address: &SocketAddr, head: Option<usize>) {
        let hash = self.hash(address);
        match address {
            SocketAddr::V4(_) => self.ipv4_buckets[hash] = head,
            SocketAddr::V6(_) => self.ipv6_buckets[hash] = head,
        }
    }

    /// Links a record at the head of its bucket
    fn link_head(&mut self, index: usize, address: SocketAddr) {
        let old_head = self.bucket_head(&address);
        self.set_bucket_head(&address, Some(index));
        if let Some(record) = self.servers[index].as_mut() {
            record.next = old_head;
            record.prev = None;
        }
        if let Some(next_index) = old_head {
            if let Some(next_record) = self.servers[next_index].as_mut() {
                next_record.prev = Some(index);
            }
        }
    }

    /// Unlinks a record from its bucket in O(1)
    fn unlink(&mut self, index: usize) {
        let (address, prev, next) = match self.servers[index].as_ref() {
            Some(record) => (record.address, record.prev, record.next),
            None => return,
        };
        match prev {
            Some(prev_index) => {
                if let Some(prev_record) = self.servers[prev_index].as_mut() {
                    prev_record.next = next;
                }
            }
            None => self.set_bucket_head(&address, next),
        }
        if let Some(next_index) = next {
            if let Some(next_record) = self.servers[next_index].as_mut() {
                next_record.prev = prev;
            }
        }
    }

    /// Removes a record: unlink, free the slot, maintain the slot trackers,
    /// and clamp the iteration cursor into the shrunken range
    fn remove(&mut self, index: usize) {
        self.unlink(index);
        let record = match self.servers[index].take() {
            Some(record) => record,
            None => return,
        };

        if self.first_free_slot.map_or(true, |first| index < first) {
            self.first_free_slot = Some(index);
        }

        if self.last_used_slot == Some(index) {
            self.last_used_slot = self.servers[..index]
                .iter()
                .rposition(|slot| slot.is_some());
        }

        match self.last_used_slot {
            Some(last) => {
                if self.crt_slot.map_or(false, |crt| crt > last) {
                    self.crt_slot = Some(last);
                }
                if self.last_iter_slot.map_or(false, |iter| iter > last) {
                    self.last_iter_slot = Some(last);
                }
            }
            None => {
                self.crt_slot = None;
                self.last_iter_slot = None;
            }
        }

        self.nb_servers -= 1;
        info!(
            "> {} timed out; {} server(s) currently registered",
            record.address, self.nb_servers
        );
    }

    /// Activity check: false for a free slot, and evicts-then-false for an
    /// expired record
    fn is_active(&mut self, index: usize) -> bool {
        let expired = match self.servers[index].as_ref() {
            Some(record) => {
                debug_assert!(
                    record.state == ServerState::Uninitialized || !record.game_name.is_empty()
                );
                record.timeout < self.now
            }
            None => return false,
        };
        if expired {
            self.remove(index);
            return false;
        }
        true
    }

    /// Walks the bucket of an address, counting active records that share
    /// its public host and promoting an exact match to the bucket head
    fn find(&mut self, address: &SocketAddr, same_public_count: &mut u32) -> Option<usize> {
        let mut cursor = self.bucket_head(address);
        while let Some(index) = cursor {
            // Capture the link before the activity check may evict the record
            let next = self.servers[index].as_ref().and_then(|record| record.next);
            if self.is_active(index) {
                if let Some(record) = self.servers[index].as_ref() {
                    let matched = same_address(&record.address, address);
                    if matched.same_public {
                        *same_public_count += 1;
                    }
                    if matched.exact {
                        self.unlink(index);
                        self.link_head(index, *address);
                        return Some(index);
                    }
                }
            }
            cursor = next;
        }
        None
    }
}
