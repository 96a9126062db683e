//! # Master Server Library
//!
//! This library implements a UDP master server: the well-known endpoint game
//! servers announce themselves to and game clients query to discover live
//! servers for their game.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! The address-indexed table of live servers: a fixed-capacity slot array,
//! dual IPv4/IPv6 hash buckets with intrusive index links, lazy timeout
//! eviction, per-address quotas, and randomised mutation-tolerant iteration.
//!
//! ### Games Module (`games`)
//! The game-name policy: an ordered set of known games plus an accept-or-
//! reject mode, consulted before any server completes registration.
//!
//! ### Address Mapping Module (`addrmap`)
//! Rewrites the published endpoint of servers behind fixed NAT. Declared as
//! `from=to` strings, resolved once at startup, looked up with
//! exact-beats-wildcard semantics.
//!
//! ### Network Module (`network`)
//! The single-task UDP loop that owns the registry, drives its clock, and
//! speaks the heartbeat / getinfo / infoResponse / getservers protocol.
//!
//! ### Snapshot Module (`snapshot`)
//! Periodically dumps the active server list to a CSV-shaped file for
//! monitoring, without mutating the registry.
//!
//! ## Design Notes
//!
//! The registry is single-threaded and cooperative: the UDP loop owns it,
//! advances its clock before each packet, and nothing inside it blocks or
//! yields. Startup errors (bad options, unresolvable mappings) are fatal;
//! steady-state refusals (quota, capacity, loopback) are warnings that drop
//! the offending packet and keep the master running.

pub mod addrmap;
pub mod error;
pub mod games;
pub mod network;
pub mod registry;
pub mod snapshot;

pub use error::MasterError;
