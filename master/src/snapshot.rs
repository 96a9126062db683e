//! Snapshot writer dumping the active server list to a sink
//!
//! One CSV-shaped line per active server, no quoting: free-text fields are
//! sanitized at registration so they never contain commas. The writer only
//! reads the registry; eviction stays the job of the packet path.

use crate::registry::ServerRegistry;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Writes one `endpoint,state,game,gametype,map,hostname,challenge_timeout`
/// line per active server
pub fn write_info<W: Write>(registry: &ServerRegistry, out: &mut W) -> io::Result<()> {
    for record in registry.active_servers() {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            record.address,
            record.state.info_word(),
            record.game_name,
            record.gametype,
            record.map_name,
            record.host_name,
            record.challenge_timeout
        )?;
    }
    Ok(())
}

/// Writes the snapshot to a file, replacing any previous content
pub fn write_info_file(registry: &ServerRegistry, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_info(registry, &mut out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrmap::AddrMapTable;
    use crate::registry::{RegistryConfig, ServerState};
    use std::net::SocketAddr;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn registry() -> ServerRegistry {
        let config = RegistryConfig {
            max_servers: 16,
            max_per_address: 0,
            rng_seed: Some(7),
            ..Default::default()
        };
        ServerRegistry::new(config, AddrMapTable::new()).unwrap()
    }

    #[test]
    fn test_snapshot_line_format() {
        let mut reg = registry();
        let record = reg.get_or_add(v4("10.0.0.1:27960"), true).unwrap();
        record.state = ServerState::Occupied;
        record.game_name = "quake3".to_string();
        record.gametype = 4;
        record.map_name = "q3dm17".to_string();
        record.host_name = "The Longest Yard".to_string();
        record.challenge_timeout = 42;
        record.timeout = 900;

        let mut out = Vec::new();
        write_info(&reg, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "10.0.0.1:27960,occupied,quake3,4,q3dm17,The Longest Yard,42\n"
        );
    }

    #[test]
    fn test_snapshot_skips_expired_without_evicting() {
        let mut reg = registry();
        reg.get_or_add(v4("10.0.0.1:27960"), true).unwrap();
        reg.get_or_add(v4("10.0.0.2:27960"), true).unwrap().timeout = 0;
        reg.set_time(1);

        let mut out = Vec::new();
        write_info(&reg, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("10.0.0.1:27960"));
        assert!(!text.contains("10.0.0.2:27960"));
        // The writer must not have mutated the registry
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_snapshot_matches_active_set() {
        let mut reg = registry();
        for host in 1..=5 {
            reg.get_or_add(v4(&format!("10.0.0.{}:27960", host)), true)
                .unwrap();
        }

        let mut out = Vec::new();
        write_info(&reg, &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let written: std::collections::HashSet<String> = text
            .lines()
            .map(|line| line.split(',').next().unwrap().to_string())
            .collect();
        let active: std::collections::HashSet<String> = reg
            .active_servers()
            .map(|record| record.address.to_string())
            .collect();

        assert_eq!(written, active);
        assert_eq!(written.len(), 5);
    }
}
