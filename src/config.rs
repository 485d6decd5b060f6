//! Simulation configuration, validated once at construction.

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelDistribution, ChannelParams};
use crate::energy::EnergyProfile;
use crate::error::{Error, Result};
use crate::traffic::TrafficMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdrConfig {
    pub enabled: bool,
    /// Installation margin subtracted from the measured SNR headroom.
    pub device_margin_db: f64,
    /// One ADR step is worth this many dB of margin.
    pub step_db: f64,
    /// Consecutive positive-margin uplinks required before a request.
    pub sustained_uplinks: u32,
    /// EWMA weight of the newest SNR sample.
    pub snr_smoothing: f64,
    pub min_tx_power_dbm: f64,
    pub max_tx_power_dbm: f64,
}

impl Default for AdrConfig {
    fn default() -> Self {
        AdrConfig {
            enabled: false,
            device_margin_db: 10.0,
            step_db: 3.0,
            sustained_uplinks: 20,
            snr_smoothing: 0.25,
            min_tx_power_dbm: 2.0,
            max_tx_power_dbm: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobilityConfig {
    pub enabled: bool,
    pub min_speed: f64,
    pub max_speed: f64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig { enabled: false, min_speed: 2.0, max_speed: 10.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub num_nodes: usize,
    pub num_gateways: usize,
    /// Side length of the square deployment area, meters.
    pub area_size: f64,
    pub traffic_mode: TrafficMode,
    /// Fixed period or mean inter-arrival gap, seconds.
    pub packet_interval: f64,
    pub steps: u64,
    /// Simulated seconds per step.
    pub step_duration: f64,
    pub payload_bytes: u32,
    pub num_channels: usize,
    pub channel_distribution: ChannelDistribution,
    pub base_frequency_hz: f64,
    pub channel_spacing_hz: f64,
    /// Fraction of time a node may occupy the channel; None disables.
    pub duty_cycle_limit: Option<f64>,
    pub duty_cycle_window: f64,
    pub mobility: MobilityConfig,
    /// All nodes start at this SF when set, otherwise a random SF in 7..=12.
    pub fixed_sf: Option<u8>,
    /// All nodes start at this power when set, otherwise 14 dBm.
    pub fixed_tx_power_dbm: Option<f64>,
    /// Joules per node; None means an unlimited supply.
    pub battery_capacity_j: Option<f64>,
    pub energy_profile: EnergyProfile,
    pub channel_params: ChannelParams,
    pub adr: AdrConfig,
    /// Seed for the run's random stream; None seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            num_nodes: 10,
            num_gateways: 1,
            area_size: 1000.0,
            traffic_mode: TrafficMode::Random,
            packet_interval: 60.0,
            steps: 100,
            step_duration: 1.0,
            payload_bytes: 20,
            num_channels: 1,
            channel_distribution: ChannelDistribution::RoundRobin,
            base_frequency_hz: 868.1e6,
            channel_spacing_hz: 200e3,
            duty_cycle_limit: Some(0.01),
            duty_cycle_window: 3600.0,
            mobility: MobilityConfig::default(),
            fixed_sf: None,
            fixed_tx_power_dbm: None,
            battery_capacity_j: None,
            energy_profile: EnergyProfile::default(),
            channel_params: ChannelParams::default(),
            adr: AdrConfig::default(),
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::invalid_parameter("num_nodes must be >= 1"));
        }
        if self.num_gateways == 0 {
            return Err(Error::invalid_parameter("num_gateways must be >= 1"));
        }
        if !(self.area_size > 0.0) {
            return Err(Error::invalid_parameter("area_size must be positive"));
        }
        if !(self.packet_interval > 0.0) {
            return Err(Error::invalid_parameter("packet_interval must be positive"));
        }
        if self.steps == 0 {
            return Err(Error::invalid_parameter("steps must be >= 1"));
        }
        if !(self.step_duration > 0.0) {
            return Err(Error::invalid_parameter("step_duration must be positive"));
        }
        if self.num_channels == 0 {
            return Err(Error::invalid_parameter("num_channels must be >= 1"));
        }
        if let Some(limit) = self.duty_cycle_limit {
            if !(limit > 0.0 && limit <= 1.0) {
                return Err(Error::invalid_parameter("duty_cycle_limit must be in (0, 1]"));
            }
            if !(self.duty_cycle_window > 0.0) {
                return Err(Error::invalid_parameter("duty_cycle_window must be positive"));
            }
        }
        if let Some(sf) = self.fixed_sf {
            if !(7..=12).contains(&sf) {
                return Err(Error::invalid_parameter(format!("SF must be 7..=12, got {sf}")));
            }
        }
        if let Some(p) = self.fixed_tx_power_dbm {
            if p < self.adr.min_tx_power_dbm || p > self.adr.max_tx_power_dbm {
                return Err(Error::invalid_parameter(format!(
                    "tx power {p} dBm outside [{}, {}]",
                    self.adr.min_tx_power_dbm, self.adr.max_tx_power_dbm
                )));
            }
        }
        if let Some(b) = self.battery_capacity_j {
            if !(b > 0.0) {
                return Err(Error::invalid_parameter("battery capacity must be positive"));
            }
        }
        if self.mobility.enabled
            && !(self.mobility.min_speed > 0.0 && self.mobility.max_speed >= self.mobility.min_speed)
        {
            return Err(Error::invalid_parameter("mobility speed range must satisfy 0 < min <= max"));
        }
        if self.adr.min_tx_power_dbm > self.adr.max_tx_power_dbm {
            return Err(Error::invalid_parameter("ADR power bounds inverted"));
        }
        if !(self.adr.snr_smoothing > 0.0 && self.adr.snr_smoothing <= 1.0) {
            return Err(Error::invalid_parameter("ADR snr_smoothing must be in (0, 1]"));
        }
        if self.adr.sustained_uplinks == 0 {
            return Err(Error::invalid_parameter("ADR sustained_uplinks must be >= 1"));
        }
        self.channel_params.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn malformed_configs_fail_fast() {
        let mut c = SimulationConfig::default();
        c.area_size = 0.0;
        assert!(c.validate().is_err());

        let mut c = SimulationConfig::default();
        c.fixed_sf = Some(6);
        assert!(c.validate().is_err());

        let mut c = SimulationConfig::default();
        c.duty_cycle_limit = Some(1.5);
        assert!(c.validate().is_err());

        let mut c = SimulationConfig::default();
        c.fixed_tx_power_dbm = Some(30.0);
        assert!(c.validate().is_err());

        let mut c = SimulationConfig::default();
        c.channel_params.bandwidth_hz = -1.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let c = SimulationConfig::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: SimulationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_nodes, c.num_nodes);
        assert_eq!(back.duty_cycle_limit, c.duty_cycle_limit);
    }
}
