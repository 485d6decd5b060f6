//! Minimal LoRaWAN subset: frame representation, the LinkADR MAC command
//! pair and the class-A receive window timing.

use serde::{Deserialize, Serialize};

/// LoRaWAN DR0..DR5 to spreading factor (EU868, 125 kHz).
pub const DR_TO_SF: [u8; 6] = [12, 11, 10, 9, 8, 7];

/// TX power index to dBm (EU868 table, index 0 = max).
pub const TX_POWER_INDEX_TO_DBM: [f64; 7] = [20.0, 17.0, 14.0, 11.0, 8.0, 5.0, 2.0];

pub fn sf_to_dr(sf: u8) -> Option<u8> {
    DR_TO_SF.iter().position(|&s| s == sf).map(|i| i as u8)
}

pub fn dbm_to_tx_power_index(dbm: f64) -> u8 {
    TX_POWER_INDEX_TO_DBM
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - dbm).abs().partial_cmp(&(*b - dbm).abs()).unwrap()
        })
        .map(|(i, _)| i as u8)
        .unwrap_or(0)
}

/// What a frame carries, branched exhaustively wherever it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MacPayload {
    /// Plain uplink application data.
    Data,
    /// Uplink data with the ADR acknowledgment bit set (LinkADRAns piggyback).
    DataWithAdrAck,
    /// Downlink LinkADRReq carrying the target data rate and TX power as
    /// EU868 table indices, decoded by the device through [`DR_TO_SF`] and
    /// [`TX_POWER_INDEX_TO_DBM`].
    AdrRequest { dr: u8, power_index: u8 },
}

impl MacPayload {
    pub fn is_adr_ack(&self) -> bool {
        matches!(self, MacPayload::DataWithAdrAck)
    }
}

/// A single frame on the air. Airtime is computed once, by
/// [`Channel::airtime`](crate::channel::Channel::airtime), and carried here
/// so collision windows and duty-cycle accounting read the same number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub node_id: u32,
    pub fcnt: u32,
    pub start_time: f64,
    pub airtime: f64,
    pub sf: u8,
    pub tx_power_dbm: f64,
    pub channel: usize,
    pub payload: MacPayload,
}

impl Frame {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.airtime
    }

    /// Two frames overlap in time if their on-air intervals intersect.
    pub fn overlaps(&self, other: &Frame) -> bool {
        self.start_time < other.end_time() && other.start_time < self.end_time()
    }
}

/// RX1 opens a fixed delay after the uplink ends.
pub const RX1_DELAY: f64 = 1.0;
/// RX2 opens one second after RX1.
pub const RX2_DELAY: f64 = 2.0;

pub fn compute_rx1(uplink_end: f64) -> f64 {
    uplink_end + RX1_DELAY
}

pub fn compute_rx2(uplink_end: f64) -> f64 {
    uplink_end + RX2_DELAY
}
