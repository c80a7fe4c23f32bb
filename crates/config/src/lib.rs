//! # Tessera Config
//!
//! Configuration and genesis handling for the tessera consensus engine.
//!
//! Configuration is an explicit struct threaded into every component
//! constructor; there is no global configuration state, and tests build
//! their own instances (usually via [`ConsensusConfig::test_config`]).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod genesis;

pub use config::ConsensusConfig;
pub use error::{ConfigError, ConfigResult};
pub use genesis::{GenesisDoc, GenesisValidator};
