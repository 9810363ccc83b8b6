//! TDMH — Time-Division Multi-Hop wireless MAC.
//!
//! A radio-connected mesh of resource-constrained nodes becomes a
//! predictable multi-hop data plane: a single master node beacons time,
//! collects the topology over a round-robin uplink, computes a
//! conflict-free transmission schedule and floods it back; every node then
//! executes its per-slot action table with deterministic latency.
//! Communication is authenticated end to end through a hash-chain keying
//! scheme and slot-bound AEAD nonces.
//!
//! The crate is pure logic over two port traits ([`ports::Radio`] and
//! [`ports::MacClock`]): the transceiver driver and the timed-sleep
//! primitive are platform adapters. An in-memory simulation adapter
//! ([`adapters::sim`]) drives the whole stack on the host, which is how
//! the integration tests run.
//!
//! Typical node bring-up:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tdmh::adapters::{SimClock, SimMedium};
//! use tdmh::config::NetworkConfig;
//! use tdmh::mac::MacEngine;
//! use tdmh::stream::StreamManager;
//!
//! let config = Arc::new(NetworkConfig::base(0, 6, 16));
//! let clock = SimClock::new();
//! let medium = SimMedium::new();
//! let stream_mgr = Arc::new(StreamManager::new(config.clone(), 0));
//! let mut engine = MacEngine::new(config, medium.radio(0, clock.clone()), clock, stream_mgr.clone())
//!     .expect("valid configuration");
//! let stop = engine.stop_handle();
//! // The calling thread becomes the MAC thread:
//! // engine.run();
//! # let _ = stop;
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod crypto;
pub mod dataphase;
pub mod diagnostics;
pub mod downlink;
pub mod error;
pub mod mac;
pub mod ports;
pub mod schedule;
pub mod stream;
pub mod time;
pub mod timesync;
pub mod uplink;
pub mod util;

pub use config::NetworkConfig;
pub use error::{Error, Result};
pub use mac::MacEngine;
pub use stream::StreamManager;
