//! Tabular result export.
//!
//! The column set and order are a compatibility contract for downstream
//! analysis tooling; do not reorder or rename.

use std::io::Write;

use serde::Serialize;

use crate::config::SimulationConfig;
use crate::simulator::Metrics;

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub nodes: usize,
    pub gateways: usize,
    pub area: f64,
    pub mode: String,
    pub interval: f64,
    pub steps: u64,
    pub delivered: u64,
    pub collisions: u64,
    #[serde(rename = "PDR(%)")]
    pub pdr_percent: f64,
    pub energy: f64,
    pub avg_delay: f64,
}

impl RunRecord {
    pub fn new(config: &SimulationConfig, metrics: &Metrics) -> Self {
        RunRecord {
            nodes: config.num_nodes,
            gateways: config.num_gateways,
            area: config.area_size,
            mode: config.traffic_mode.to_string(),
            interval: config.packet_interval,
            steps: config.steps,
            delivered: metrics.delivered,
            collisions: metrics.collided,
            pdr_percent: metrics.pdr_percent(),
            energy: metrics.total_energy_j,
            avg_delay: metrics.avg_delay_s(),
        }
    }

    /// Append this record, with a header row, to any writer.
    pub fn write_csv<W: Write>(&self, writer: W) -> csv::Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        w.serialize(self)?;
        w.flush()?;
        Ok(())
    }
}
