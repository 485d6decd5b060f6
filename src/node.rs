//! End-device model: traffic decisions, radio parameters, receive windows,
//! energy and delivery bookkeeping.

use std::collections::VecDeque;

use rand::Rng;
use serde::Serialize;

use crate::channel::Channel;
use crate::duty_cycle::DutyCycleManager;
use crate::energy::EnergyProfile;
use crate::lorawan::{compute_rx1, compute_rx2, Frame, MacPayload, DR_TO_SF, TX_POWER_INDEX_TO_DBM};
use crate::mobility::{MobilityState, Position};
use crate::traffic::TrafficModel;

/// Entries kept in the rolling delivery history for the recent-PDR metric.
const HISTORY_LEN: usize = 20;

const TIME_EPS: f64 = 1e-9;

/// Outcome of one uplink attempt, resolved after collision handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Delivered,
    Collided,
    /// No gateway could demodulate the frame (out of range or below SNR floor).
    NoSignal,
}

#[derive(Debug)]
pub struct Node {
    pub id: u32,
    pub position: Position,
    pub initial_position: Position,
    pub sf: u8,
    pub tx_power_dbm: f64,
    pub initial_sf: u8,
    pub initial_tx_power_dbm: f64,
    /// Index into the simulator's channel set.
    pub channel: usize,

    traffic: TrafficModel,
    next_attempt: f64,
    pub fcnt_up: u32,
    pub fcnt_down: u32,

    history: VecDeque<TxOutcome>,
    pub packets_sent: u64,
    pub packets_success: u64,
    pub packets_collision: u64,

    battery_capacity_j: Option<f64>,
    battery_remaining_j: Option<f64>,
    pub alive: bool,
    pub energy_tx_j: f64,
    pub energy_rx_j: f64,
    profile: EnergyProfile,

    /// Set when a LinkADRReq was applied; the next uplink carries the ack.
    adr_ack_pending: bool,
    last_uplink_end: Option<f64>,

    pub mobility: Option<MobilityState>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        position: Position,
        sf: u8,
        tx_power_dbm: f64,
        channel: usize,
        traffic: TrafficModel,
        battery_capacity_j: Option<f64>,
        profile: EnergyProfile,
        first_attempt: f64,
    ) -> Self {
        Node {
            id,
            position,
            initial_position: position,
            sf,
            tx_power_dbm,
            initial_sf: sf,
            initial_tx_power_dbm: tx_power_dbm,
            channel,
            traffic,
            next_attempt: first_attempt,
            fcnt_up: 0,
            fcnt_down: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
            packets_sent: 0,
            packets_success: 0,
            packets_collision: 0,
            battery_capacity_j,
            battery_remaining_j: battery_capacity_j,
            alive: true,
            energy_tx_j: 0.0,
            energy_rx_j: 0.0,
            profile,
            adr_ack_pending: false,
            last_uplink_end: None,
            mobility: None,
        }
    }

    /// Decide whether to put a frame on the air this step. A duty-cycle
    /// refusal moves the attempt to the manager's suggested retry time
    /// instead of re-asking every step.
    pub fn maybe_transmit<R: Rng>(
        &mut self,
        now: f64,
        channel: &Channel,
        duty: &mut DutyCycleManager,
        payload_bytes: u32,
        rng: &mut R,
    ) -> Option<Frame> {
        if !self.alive || now + TIME_EPS < self.next_attempt {
            return None;
        }
        let airtime = channel.airtime(self.sf, payload_bytes);
        if !duty.may_transmit(self.id, now, airtime) {
            let retry = duty.next_available_time(self.id, now, airtime);
            log::debug!("node {} duty-cycle deferred until t={retry:.2}", self.id);
            self.next_attempt = retry.max(now + TIME_EPS);
            return None;
        }
        duty.record_transmission(self.id, now, airtime);

        let payload = if self.adr_ack_pending {
            self.adr_ack_pending = false;
            MacPayload::DataWithAdrAck
        } else {
            MacPayload::Data
        };
        let frame = Frame {
            node_id: self.id,
            fcnt: self.fcnt_up,
            start_time: now,
            airtime,
            sf: self.sf,
            tx_power_dbm: self.tx_power_dbm,
            channel: self.channel,
            payload,
        };
        self.fcnt_up += 1;
        self.packets_sent += 1;
        let energy = self.profile.tx_energy(self.tx_power_dbm, airtime);
        self.energy_tx_j += energy;
        self.drain(energy);
        self.last_uplink_end = Some(frame.end_time());
        self.next_attempt = now + self.traffic.next_gap(rng);
        Some(frame)
    }

    /// Whether `now` falls inside RX1..RX2 of the most recent uplink.
    pub fn in_receive_window(&self, now: f64) -> bool {
        match self.last_uplink_end {
            Some(end) => {
                now + TIME_EPS >= compute_rx1(end) && now <= compute_rx2(end) + TIME_EPS
            }
            None => false,
        }
    }

    /// True once the receive windows of the last uplink have all closed.
    pub fn receive_window_expired(&self, now: f64) -> bool {
        match self.last_uplink_end {
            Some(end) => now > compute_rx2(end) + TIME_EPS,
            None => true,
        }
    }

    /// Apply a downlink that arrived inside a receive window.
    pub fn receive_downlink(&mut self, frame: &Frame) {
        let energy = self.profile.rx_window_energy();
        self.energy_rx_j += energy;
        self.drain(energy);
        self.fcnt_down = self.fcnt_down.max(frame.fcnt + 1);
        match frame.payload {
            MacPayload::AdrRequest { dr, power_index } => {
                // Malformed indices are ignored without an ack.
                let decoded = (
                    DR_TO_SF.get(dr as usize),
                    TX_POWER_INDEX_TO_DBM.get(power_index as usize),
                );
                if let (Some(&sf), Some(&tx_power_dbm)) = decoded {
                    log::debug!(
                        "node {} applying ADR: SF{} -> SF{}, {:.1} -> {:.1} dBm",
                        self.id, self.sf, sf, self.tx_power_dbm, tx_power_dbm
                    );
                    self.sf = sf;
                    self.tx_power_dbm = tx_power_dbm;
                    self.adr_ack_pending = true;
                }
            }
            MacPayload::Data | MacPayload::DataWithAdrAck => {
                // Plain downlink data, nothing to apply.
            }
        }
    }

    pub fn record_outcome(&mut self, outcome: TxOutcome) {
        match outcome {
            TxOutcome::Delivered => self.packets_success += 1,
            TxOutcome::Collided => self.packets_collision += 1,
            TxOutcome::NoSignal => {}
        }
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }

    /// Lifetime packet delivery ratio.
    pub fn pdr(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_success as f64 / self.packets_sent as f64
        }
    }

    /// Delivery ratio over the rolling history window.
    pub fn recent_pdr(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let ok = self.history.iter().filter(|o| **o == TxOutcome::Delivered).count();
        ok as f64 / self.history.len() as f64
    }

    /// Remaining battery as a 0..=1 ratio; 1.0 when unlimited.
    pub fn battery_level(&self) -> f64 {
        match (self.battery_capacity_j, self.battery_remaining_j) {
            (Some(cap), Some(rem)) => (rem / cap).max(0.0),
            _ => 1.0,
        }
    }

    fn drain(&mut self, joules: f64) {
        if let Some(rem) = self.battery_remaining_j.as_mut() {
            *rem -= joules;
            if *rem <= 0.0 {
                *rem = 0.0;
                self.alive = false;
                log::debug!("node {} battery depleted", self.id);
            }
        }
    }
}

/// Dashboard-facing view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub sf: u8,
    pub tx_power_dbm: f64,
    pub recent_pdr: f64,
    pub battery_level: f64,
    pub alive: bool,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        NodeSnapshot {
            id: node.id,
            x: node.position.x,
            y: node.position.y,
            sf: node.sf,
            tx_power_dbm: node.tx_power_dbm,
            recent_pdr: node.recent_pdr(),
            battery_level: node.battery_level(),
            alive: node.alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelParams};
    use crate::traffic::{TrafficMode, TrafficModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_node(battery: Option<f64>) -> Node {
        Node::new(
            1,
            Position { x: 0.0, y: 0.0 },
            7,
            14.0,
            0,
            TrafficModel::new(TrafficMode::Periodic, 10.0).unwrap(),
            battery,
            EnergyProfile::default(),
            0.0,
        )
    }

    fn test_channel() -> Channel {
        Channel::new(868e6, ChannelParams::default()).unwrap()
    }

    #[test]
    fn periodic_node_fires_on_schedule() {
        let mut node = test_node(None);
        let ch = test_channel();
        let mut duty = DutyCycleManager::new(None, 3600.0);
        let mut rng = StdRng::seed_from_u64(0);
        let mut fired = Vec::new();
        for t in 0..30 {
            if node.maybe_transmit(t as f64, &ch, &mut duty, 20, &mut rng).is_some() {
                fired.push(t);
            }
        }
        assert_eq!(fired, vec![0, 10, 20]);
        assert_eq!(node.fcnt_up, 3);
        assert_eq!(node.packets_sent, 3);
    }

    #[test]
    fn duty_refusal_defers_instead_of_sending() {
        let mut node = test_node(None);
        let ch = test_channel();
        // Tiny budget: one frame fills the window.
        let airtime = ch.airtime(7, 20);
        let mut duty = DutyCycleManager::new(Some(airtime / 100.0), 100.0);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(node.maybe_transmit(0.0, &ch, &mut duty, 20, &mut rng).is_some());
        // Next periodic attempt at t=10 must be refused and deferred.
        assert!(node.maybe_transmit(10.0, &ch, &mut duty, 20, &mut rng).is_none());
        assert_eq!(node.packets_sent, 1);
    }

    #[test]
    fn adr_request_applies_and_ack_rides_next_uplink() {
        let mut node = test_node(None);
        let ch = test_channel();
        let mut duty = DutyCycleManager::new(None, 3600.0);
        let mut rng = StdRng::seed_from_u64(0);
        let up = node.maybe_transmit(0.0, &ch, &mut duty, 20, &mut rng).unwrap();
        assert_eq!(up.payload, MacPayload::Data);

        let down = Frame {
            node_id: 1,
            fcnt: 0,
            start_time: up.end_time() + 1.0,
            airtime: 0.05,
            sf: 7,
            tx_power_dbm: 14.0,
            channel: 0,
            // DR3 = SF9, power index 4 = 8 dBm
            payload: MacPayload::AdrRequest { dr: 3, power_index: 4 },
        };
        assert!(node.in_receive_window(up.end_time() + 1.5));
        node.receive_downlink(&down);
        assert_eq!(node.sf, 9);
        assert_eq!(node.tx_power_dbm, 8.0);

        let up2 = node.maybe_transmit(10.0, &ch, &mut duty, 20, &mut rng).unwrap();
        assert_eq!(up2.payload, MacPayload::DataWithAdrAck);
        assert_eq!(up2.sf, 9);
        // The ack bit is one-shot.
        let up3 = node.maybe_transmit(20.0, &ch, &mut duty, 20, &mut rng).unwrap();
        assert_eq!(up3.payload, MacPayload::Data);
    }

    #[test]
    fn malformed_adr_indices_are_ignored() {
        let mut node = test_node(None);
        let ch = test_channel();
        let mut duty = DutyCycleManager::new(None, 3600.0);
        let mut rng = StdRng::seed_from_u64(0);
        let up = node.maybe_transmit(0.0, &ch, &mut duty, 20, &mut rng).unwrap();
        let down = Frame {
            node_id: 1,
            fcnt: 0,
            start_time: up.end_time() + 1.0,
            airtime: 0.05,
            sf: 7,
            tx_power_dbm: 14.0,
            channel: 0,
            payload: MacPayload::AdrRequest { dr: 9, power_index: 0 },
        };
        node.receive_downlink(&down);
        assert_eq!(node.sf, 7);
        assert_eq!(node.tx_power_dbm, 14.0);
        // No ack for a request the device could not apply.
        let up2 = node.maybe_transmit(10.0, &ch, &mut duty, 20, &mut rng).unwrap();
        assert_eq!(up2.payload, MacPayload::Data);
    }

    #[test]
    fn receive_window_closes_after_rx2() {
        let mut node = test_node(None);
        let ch = test_channel();
        let mut duty = DutyCycleManager::new(None, 3600.0);
        let mut rng = StdRng::seed_from_u64(0);
        let up = node.maybe_transmit(0.0, &ch, &mut duty, 20, &mut rng).unwrap();
        assert!(!node.in_receive_window(up.end_time() + 0.5));
        assert!(node.in_receive_window(up.end_time() + 1.0));
        assert!(node.in_receive_window(up.end_time() + 2.0));
        assert!(!node.in_receive_window(up.end_time() + 2.5));
        assert!(node.receive_window_expired(up.end_time() + 2.5));
    }

    #[test]
    fn depleted_battery_silences_the_node() {
        // Barely enough for one transmission at 14 dBm.
        let mut node = test_node(Some(1e-6));
        let ch = test_channel();
        let mut duty = DutyCycleManager::new(None, 3600.0);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(node.maybe_transmit(0.0, &ch, &mut duty, 20, &mut rng).is_some());
        assert!(!node.alive);
        assert!(node.maybe_transmit(10.0, &ch, &mut duty, 20, &mut rng).is_none());
        assert_eq!(node.battery_level(), 0.0);
    }

    #[test]
    fn recent_pdr_tracks_rolling_window() {
        let mut node = test_node(None);
        for _ in 0..10 {
            node.record_outcome(TxOutcome::Delivered);
        }
        for _ in 0..10 {
            node.record_outcome(TxOutcome::Collided);
        }
        assert!((node.recent_pdr() - 0.5).abs() < 1e-12);
        // 20 more losses push every success out of the window.
        for _ in 0..20 {
            node.record_outcome(TxOutcome::NoSignal);
        }
        assert_eq!(node.recent_pdr(), 0.0);
    }
}
