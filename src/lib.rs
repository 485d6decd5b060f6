//! Discrete-step LoRa/LoRaWAN network simulator.
//!
//! Models radio propagation with log-distance path loss, packet collisions
//! with the capture effect, regulatory duty cycling, and a simplified
//! LoRaWAN ADR exchange between end-devices and a network server. Time
//! advances in fixed increments; all randomness flows through a seedable
//! generator so runs are reproducible.
//!
//! ```no_run
//! use lorasim::config::SimulationConfig;
//! use lorasim::simulator::Simulator;
//!
//! let mut config = SimulationConfig::default();
//! config.num_nodes = 50;
//! config.seed = Some(42);
//! let mut sim = Simulator::new(config).unwrap();
//! let metrics = sim.run();
//! println!("PDR: {:.2}%", metrics.pdr_percent());
//! ```

pub mod channel;
pub mod config;
pub mod duty_cycle;
pub mod energy;
pub mod error;
pub mod export;
pub mod gateway;
pub mod lorawan;
pub mod mobility;
pub mod node;
pub mod server;
pub mod simulator;
pub mod traffic;

pub use config::SimulationConfig;
pub use error::{Error, Result};
pub use simulator::{Metrics, SimState, SimulationSnapshot, Simulator};
