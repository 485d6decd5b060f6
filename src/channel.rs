//! Radio propagation and LoRa airtime.
//!
//! Log-distance path loss with log-normal shadowing, a thermal noise floor
//! derived from the configured bandwidth, and fast fading on the SNR.
//! Collision power checks and duty-cycle accounting both read the airtime
//! computed here.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Demodulation SNR floor per spreading factor (dB), SF7..SF12.
/// Values from the LoRaWAN regional parameters; lower SF needs more SNR.
pub const REQUIRED_SNR: [f64; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

pub fn required_snr(sf: u8) -> f64 {
    REQUIRED_SNR[(sf - 7) as usize]
}

/// Stochastic and propagation parameters shared by every channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParams {
    pub bandwidth_hz: f64,
    /// CR index: 1 => 4/5 .. 4 => 4/8.
    pub coding_rate: u32,
    pub path_loss_exp: f64,
    pub cable_loss_db: f64,
    /// Thermal noise density, dBm/Hz.
    pub receiver_noise_floor_dbm: f64,
    pub noise_figure_db: f64,
    pub noise_std_db: f64,
    pub fast_fading_std_db: f64,
    pub interference_db: f64,
    pub tx_power_std_db: f64,
    pub capture_threshold_db: f64,
}

impl Default for ChannelParams {
    fn default() -> Self {
        ChannelParams {
            bandwidth_hz: 125e3,
            coding_rate: 1,
            path_loss_exp: 2.7,
            cable_loss_db: 0.0,
            receiver_noise_floor_dbm: -174.0,
            noise_figure_db: 6.0,
            noise_std_db: 0.0,
            fast_fading_std_db: 0.0,
            interference_db: 0.0,
            tx_power_std_db: 0.0,
            capture_threshold_db: 6.0,
        }
    }
}

impl ChannelParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.bandwidth_hz > 0.0) {
            return Err(Error::invalid_parameter("bandwidth must be positive"));
        }
        if !(1..=4).contains(&self.coding_rate) {
            return Err(Error::invalid_parameter("coding rate index must be 1..=4"));
        }
        if !(self.path_loss_exp > 0.0) {
            return Err(Error::invalid_parameter("path loss exponent must be positive"));
        }
        for (name, v) in [
            ("noise_std_db", self.noise_std_db),
            ("fast_fading_std_db", self.fast_fading_std_db),
            ("tx_power_std_db", self.tx_power_std_db),
            ("capture_threshold_db", self.capture_threshold_db),
        ] {
            if v < 0.0 || !v.is_finite() {
                return Err(Error::invalid_parameter(format!("{name} must be >= 0")));
            }
        }
        Ok(())
    }
}

/// One propagation channel at a fixed carrier frequency.
#[derive(Debug, Clone)]
pub struct Channel {
    pub frequency_hz: f64,
    pub params: ChannelParams,
    /// Loss at the 1 m reference distance (free space).
    reference_loss_db: f64,
}

const PREAMBLE_SYMBOLS: f64 = 8.0;
/// SF at and above which low data rate optimization is enabled (125 kHz).
const LDRO_SF_THRESHOLD: u8 = 11;

impl Channel {
    pub fn new(frequency_hz: f64, params: ChannelParams) -> Result<Self> {
        params.validate()?;
        if !(frequency_hz > 0.0) {
            return Err(Error::invalid_parameter("carrier frequency must be positive"));
        }
        // FSPL at d0 = 1 m: 32.45 + 20*log10(f_MHz) + 20*log10(0.001 km)
        let freq_mhz = frequency_hz / 1e6;
        let reference_loss_db = 32.45 + 20.0 * freq_mhz.log10() - 60.0;
        Ok(Channel { frequency_hz, params, reference_loss_db })
    }

    /// Noise floor (dBm) over the configured bandwidth, deterministic part.
    pub fn noise_floor_dbm(&self) -> f64 {
        self.params.receiver_noise_floor_dbm
            + 10.0 * self.params.bandwidth_hz.log10()
            + self.params.noise_figure_db
    }

    /// Log-distance path loss in dB at `distance` meters.
    pub fn path_loss(&self, distance: f64) -> Result<f64> {
        if !(distance > 0.0) || !distance.is_finite() {
            return Err(Error::invalid_parameter(format!(
                "distance must be positive and finite, got {distance}"
            )));
        }
        let d = distance.max(1.0);
        Ok(self.reference_loss_db
            + 10.0 * self.params.path_loss_exp * d.log10()
            + self.params.cable_loss_db)
    }

    /// Sample one reception: returns (rssi, snr) in dBm/dB. Every stochastic
    /// term is drawn fresh so repeated calls on the same geometry differ.
    pub fn compute_rssi<R: Rng>(
        &self,
        tx_power_dbm: f64,
        distance: f64,
        rng: &mut R,
    ) -> Result<(f64, f64)> {
        let loss = self.path_loss(distance)?;
        let jitter = gaussian(self.params.tx_power_std_db, rng);
        let rssi = tx_power_dbm - loss + jitter;

        let noise = self.noise_floor_dbm()
            + gaussian(self.params.noise_std_db, rng)
            + self.params.interference_db;
        let snr = rssi - noise + gaussian(self.params.fast_fading_std_db, rng);

        if !rssi.is_finite() || !snr.is_finite() {
            return Err(Error::invalid_parameter(
                "non-finite RSSI/SNR from channel geometry".to_string(),
            ));
        }
        Ok((rssi, snr))
    }

    /// Full frame airtime in seconds.
    ///
    /// Symbol-count formula from the SX127x datasheet, as used by lorasim
    /// (https://github.com/mcbor/lorasim/blob/main/loraDir.py).
    pub fn airtime(&self, sf: u8, payload_bytes: u32) -> f64 {
        let bw = self.params.bandwidth_hz;
        let de = if sf >= LDRO_SF_THRESHOLD { 1.0 } else { 0.0 };
        let tsym = (2f64).powi(sf as i32) / bw;
        let tpreamble = (PREAMBLE_SYMBOLS + 4.25) * tsym;
        // explicit header, CRC on: 8*PL - 4*SF + 28 + 16
        let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf as f64 + 28.0 + 16.0;
        let denominator = 4.0 * (sf as f64 - 2.0 * de);
        let n_payload =
            8.0 + ((numerator / denominator).ceil()).max(0.0) * (self.params.coding_rate as f64 + 4.0);
        tpreamble + n_payload * tsym
    }

    /// Link-budget distance bound: beyond this, the SNR cannot clear the
    /// demodulation floor even with zero fading. Used as the simulator's
    /// early filter before the per-gateway stochastic computation.
    pub fn max_range(&self, tx_power_dbm: f64, sf: u8) -> f64 {
        let slack = 3.0
            * (self.params.noise_std_db + self.params.fast_fading_std_db + self.params.tx_power_std_db);
        let max_loss = tx_power_dbm - self.noise_floor_dbm() - self.params.interference_db
            - required_snr(sf)
            + slack;
        let exp = (max_loss - self.reference_loss_db - self.params.cable_loss_db)
            / (10.0 * self.params.path_loss_exp);
        10f64.powf(exp).max(1.0)
    }
}

fn gaussian<R: Rng>(std: f64, rng: &mut R) -> f64 {
    if std > 0.0 {
        // std validated non-negative at construction
        Normal::new(0.0, std).unwrap().sample(rng)
    } else {
        0.0
    }
}

/// Channel assignment policy for multi-channel deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelDistribution {
    RoundRobin,
    Random,
}

/// A set of channels plus the policy handing them out to nodes.
#[derive(Debug, Clone)]
pub struct MultiChannel {
    channels: Vec<Channel>,
    method: ChannelDistribution,
    rr_index: usize,
}

impl MultiChannel {
    pub fn new(
        base_frequency_hz: f64,
        spacing_hz: f64,
        count: usize,
        method: ChannelDistribution,
        params: ChannelParams,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid_parameter("channel count must be >= 1"));
        }
        let channels = (0..count)
            .map(|i| Channel::new(base_frequency_hz + i as f64 * spacing_hz, params.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(MultiChannel { channels, method, rr_index: 0 })
    }

    pub fn select<R: Rng>(&mut self, rng: &mut R) -> usize {
        match self.method {
            ChannelDistribution::Random => rng.gen_range(0..self.channels.len()),
            ChannelDistribution::RoundRobin => {
                let idx = self.rr_index % self.channels.len();
                self.rr_index += 1;
                idx
            }
        }
    }

    pub fn get(&self, index: usize) -> &Channel {
        &self.channels[index]
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
