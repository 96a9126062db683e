//! Address mapping table for servers behind fixed NAT
//!
//! A mapping rewrites a server's visible endpoint before it is published to
//! clients, so a master colocated with a private-network server can still
//! hand out the server's public address. Mappings are declared as
//! `"from[:port]=to[:port]"` strings and built in two phases: declarations
//! pile up unresolved, then [`AddrMapTable::resolve_all`] resolves both sides
//! to IPv4 once at startup (the only place blocking name resolution is
//! tolerated) and builds the sorted lookup list.
//!
//! Lookup prefers an exact `(address, port)` match over a per-address
//! wildcard (`port 0`); the mapping engine is IPv4 only.

use crate::error::MasterError;
use log::{debug, info};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// One resolved address mapping
///
/// The original declaration strings are kept for diagnostics. A `from_port`
/// of 0 makes the mapping a wildcard for its source address; a `to_port` of
/// 0 means "keep the source port" when rewriting.
#[derive(Debug, Clone)]
pub struct AddrMap {
    pub from_string: String,
    pub to_string: String,
    pub from_ip: Ipv4Addr,
    pub from_port: u16,
    pub to_ip: Ipv4Addr,
    pub to_port: u16,
}

impl AddrMap {
    /// Applies the mapping to an endpoint with the given original port
    pub fn rewrite(&self, original_port: u16) -> SocketAddrV4 {
        let port = if self.to_port != 0 {
            self.to_port
        } else {
            original_port
        };
        SocketAddrV4::new(self.to_ip, port)
    }
}

/// Two-phase mapping table: unresolved declarations, then a sorted list
#[derive(Debug, Default)]
pub struct AddrMapTable {
    pending: Vec<(String, String)>,
    maps: Vec<AddrMap>,
}

impl AddrMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an unresolved mapping declaration of the form `"from=to"`
    pub fn add(&mut self, mapping: &str) -> Result<(), MasterError> {
        let (from, to) = mapping.split_once('=').ok_or_else(|| {
            MasterError::InvalidOptParams(format!(
                "invalid syntax in address mapping \"{}\"",
                mapping
            ))
        })?;
        if from.is_empty() || to.is_empty() {
            return Err(MasterError::InvalidOptParams(format!(
                "invalid syntax in address mapping \"{}\"",
                mapping
            )));
        }
        self.pending.push((from.to_string(), to.to_string()));
        Ok(())
    }

    /// Resolves every pending declaration and builds the sorted list
    ///
    /// Both sides must resolve to IPv4. Mapping from or to `0.0.0.0` is
    /// forbidden, as is mapping to a loopback address. Two mappings may not
    /// share the same source endpoint.
    pub fn resolve_all(&mut self) -> Result<(), MasterError> {
        while let Some((from_string, to_string)) = self.pending.pop() {
            let (from_ip, from_port) = resolve_ipv4_endpoint(&from_string)?;
            let (to_ip, to_port) = resolve_ipv4_endpoint(&to_string)?;

            if from_ip.is_unspecified() || to_ip.is_unspecified() {
                return Err(MasterError::InvalidOptParams(
                    "mapping from or to 0.0.0.0 is forbidden".to_string(),
                ));
            }
            if to_ip.octets()[0] == 127 {
                return Err(MasterError::InvalidOptParams(
                    "mapping to a loopback address is forbidden".to_string(),
                ));
            }

            self.insert_sorted(AddrMap {
                from_string,
                to_string,
                from_ip,
                from_port,
                to_ip,
                to_port,
            })?;
        }
        Ok(())
    }

    fn insert_sorted(&mut self, map: AddrMap) -> Result<(), MasterError> {
        let key = (u32::from(map.from_ip), map.from_port);
        match self
            .maps
            .binary_search_by_key(&key, |m| (u32::from(m.from_ip), m.from_port))
        {
            Ok(_) => Err(MasterError::DuplicateMapping(format!(
                "{}:{}",
                map.from_ip, map.from_port
            ))),
            Err(index) => {
                info!(
                    "> Address \"{}\" ({}:{}) mapped to \"{}\" ({}:{})",
                    map.from_string,
                    map.from_ip,
                    map.from_port,
                    map.to_string,
                    map.to_ip,
                    map.to_port
                );
                self.maps.insert(index, map);
                Ok(())
            }
        }
    }

    /// Finds the mapping for an endpoint: exact port match wins, then the
    /// address wildcard, then nothing. Returns a stable index into the table.
    pub fn lookup(&self, ip: Ipv4Addr, port: u16) -> Option<usize> {
        let ip_key = u32::from(ip);
        let mut wildcard = None;

        for (index, map) in self.maps.iter().enumerate() {
            let from_key = u32::from(map.from_ip);
            if from_key > ip_key {
                break;
            }
            if from_key == ip_key {
                if map.from_port > port {
                    // The list is sorted by port: no exact match remains
                    return wildcard;
                }
                if map.from_port == port {
                    return Some(index);
                }
                if map.from_port == 0 {
                    wildcard = Some(index);
                }
            }
        }

        wildcard
    }

    pub fn get(&self, index: usize) -> Option<&AddrMap> {
        self.maps.get(index)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// The resolved mappings in their sorted order
    pub fn iter(&self) -> impl Iterator<Item = &AddrMap> {
        self.maps.iter()
    }
}

/// Resolves one side of a mapping to an IPv4 address plus optional port
///
/// A missing port resolves to 0 (wildcard on the source side, keep-port on
/// the destination side). An explicit port must be a nonzero number.
fn resolve_ipv4_endpoint(name: &str) -> Result<(Ipv4Addr, u16), MasterError> {
    let (host, port) = match name.split_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| {
                    MasterError::InvalidOptParams(format!(
                        "{} is not a valid port number",
                        port_str
                    ))
                })?;
            (host, port)
        }
        None => (name, 0),
    };

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| MasterError::ResolutionFailed(host.to_string()))?;

    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            debug!("> \"{}\" resolved to {}:{}", name, v4.ip(), port);
            return Ok((*v4.ip(), port));
        }
    }

    Err(MasterError::ResolutionFailed(format!(
        "{} is not an IPv4 address",
        host
    )))
}
