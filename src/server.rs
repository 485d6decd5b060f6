//! Network server: uplink deduplication and the ADR state machine.
//!
//! Per node the server is either `Idle` or `RequestSent`. A LinkADRReq is
//! issued only from `Idle`, after the smoothed link margin has kept the
//! same sign for a configured number of consecutive uplinks: a sustained
//! surplus speeds the node up, a sustained deficit walks it back to a more
//! robust setting. The state returns to `Idle` when an uplink arrives with
//! the ADR ack bit, or when the request's downlink expires undelivered.

use std::collections::HashMap;

use crate::channel::required_snr;
use crate::config::AdrConfig;
use crate::lorawan::{dbm_to_tx_power_index, sf_to_dr, Frame};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdrPhase {
    Idle,
    RequestSent { sf: u8, tx_power_dbm: f64 },
}

#[derive(Debug)]
struct AdrState {
    phase: AdrPhase,
    snr_smoothed: Option<f64>,
    positive_margin_streak: u32,
    negative_margin_streak: u32,
    /// Highest uplink sequence number accepted so far.
    last_fcnt: Option<u32>,
    fcnt_down: u32,
    /// Gateway that delivered the most recent accepted uplink.
    last_gateway: u32,
}

impl AdrState {
    fn new() -> Self {
        AdrState {
            phase: AdrPhase::Idle,
            snr_smoothed: None,
            positive_margin_streak: 0,
            negative_margin_streak: 0,
            last_fcnt: None,
            fcnt_down: 0,
            last_gateway: 0,
        }
    }
}

/// Parameter change the server wants pushed to a node, already encoded as
/// the LinkADRReq (data rate, power index) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdrCommand {
    pub node_id: u32,
    pub gateway_id: u32,
    pub fcnt_down: u32,
    pub dr: u8,
    pub power_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkDisposition {
    /// First copy of this frame; counts as a delivery.
    Accepted,
    /// Same frame already accepted via another gateway this step.
    Duplicate,
}

#[derive(Debug)]
pub struct NetworkServer {
    config: AdrConfig,
    states: HashMap<u32, AdrState>,
    pub packets_received: u64,
    pub adr_requests_issued: u64,
}

impl NetworkServer {
    pub fn new(config: AdrConfig) -> Self {
        NetworkServer {
            config,
            states: HashMap::new(),
            packets_received: 0,
            adr_requests_issued: 0,
        }
    }

    /// Process one surviving uplink copy. Duplicates only feed the SNR
    /// statistics; the first copy is authoritative and may yield an ADR
    /// command for the simulator to schedule as a downlink.
    pub fn receive_uplink(
        &mut self,
        frame: &Frame,
        gateway_id: u32,
        snr: f64,
    ) -> (UplinkDisposition, Option<AdrCommand>) {
        let state = self.states.entry(frame.node_id).or_insert_with(AdrState::new);

        let duplicate = matches!(state.last_fcnt, Some(last) if frame.fcnt <= last);
        Self::update_snr(&self.config, state, snr);
        if duplicate {
            return (UplinkDisposition::Duplicate, None);
        }
        state.last_fcnt = Some(frame.fcnt);
        state.last_gateway = gateway_id;
        self.packets_received += 1;

        if frame.payload.is_adr_ack() {
            if let AdrPhase::RequestSent { .. } = state.phase {
                log::debug!("node {} acknowledged ADR request", frame.node_id);
                state.phase = AdrPhase::Idle;
                state.positive_margin_streak = 0;
                state.negative_margin_streak = 0;
            }
        }

        let command = if self.config.enabled {
            Self::evaluate_adr(&self.config, state, frame)
        } else {
            None
        };
        if command.is_some() {
            self.adr_requests_issued += 1;
        }
        (UplinkDisposition::Accepted, command)
    }

    fn update_snr(config: &AdrConfig, state: &mut AdrState, snr: f64) {
        state.snr_smoothed = Some(match state.snr_smoothed {
            Some(prev) => config.snr_smoothing * snr + (1.0 - config.snr_smoothing) * prev,
            None => snr,
        });
    }

    fn evaluate_adr(config: &AdrConfig, state: &mut AdrState, frame: &Frame) -> Option<AdrCommand> {
        let snr = state.snr_smoothed?;
        let margin = snr - required_snr(frame.sf) - config.device_margin_db;
        if margin > 0.0 {
            state.positive_margin_streak += 1;
            state.negative_margin_streak = 0;
        } else {
            state.negative_margin_streak += 1;
            state.positive_margin_streak = 0;
        }
        if state.positive_margin_streak < config.sustained_uplinks
            && state.negative_margin_streak < config.sustained_uplinks
        {
            return None;
        }
        // No new request while one is outstanding, however the margin moves.
        if !matches!(state.phase, AdrPhase::Idle) {
            return None;
        }

        let (sf, tx_power_dbm) = Self::walk_steps(config, frame.sf, frame.tx_power_dbm, margin);
        state.positive_margin_streak = 0;
        state.negative_margin_streak = 0;
        if sf == frame.sf && (tx_power_dbm - frame.tx_power_dbm).abs() < f64::EPSILON {
            return None;
        }
        let dr = sf_to_dr(sf)?;
        let power_index = dbm_to_tx_power_index(tx_power_dbm);
        state.phase = AdrPhase::RequestSent { sf, tx_power_dbm };
        state.fcnt_down += 1;
        log::debug!(
            "ADR request for node {}: SF{} -> SF{}, {:.1} -> {:.1} dBm (margin {margin:.1} dB)",
            frame.node_id, frame.sf, sf, frame.tx_power_dbm, tx_power_dbm
        );
        Some(AdrCommand {
            node_id: frame.node_id,
            gateway_id: state.last_gateway,
            fcnt_down: state.fcnt_down - 1,
            dr,
            power_index,
        })
    }

    /// Spend the signed margin in fixed-dB steps. With headroom, shrink the
    /// spreading factor toward SF7 first (biggest airtime win), then back
    /// the power off toward the configured floor. With a deficit, raise the
    /// power toward the ceiling first, then the spreading factor toward
    /// SF12.
    fn walk_steps(config: &AdrConfig, sf: u8, tx_power_dbm: f64, margin: f64) -> (u8, f64) {
        let mut sf = sf;
        let mut power = tx_power_dbm;
        let mut steps = (margin / config.step_db).trunc() as i64;
        if steps >= 0 {
            while steps > 0 {
                if sf > 7 {
                    sf -= 1;
                } else if power - config.step_db >= config.min_tx_power_dbm {
                    power -= config.step_db;
                } else {
                    break;
                }
                steps -= 1;
            }
        } else {
            while steps < 0 {
                if power + config.step_db <= config.max_tx_power_dbm {
                    power += config.step_db;
                } else if sf < 12 {
                    sf += 1;
                } else {
                    break;
                }
                steps += 1;
            }
        }
        (sf, power)
    }

    /// The request's downlink was dropped; allow a future request.
    pub fn downlink_expired(&mut self, node_id: u32) {
        if let Some(state) = self.states.get_mut(&node_id) {
            if matches!(state.phase, AdrPhase::RequestSent { .. }) {
                log::debug!("ADR downlink for node {node_id} expired, back to idle");
                state.phase = AdrPhase::Idle;
            }
        }
    }

    pub fn phase(&self, node_id: u32) -> AdrPhase {
        self.states
            .get(&node_id)
            .map(|s| s.phase)
            .unwrap_or(AdrPhase::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::MacPayload;

    fn adr_config(sustained: u32) -> AdrConfig {
        AdrConfig {
            enabled: true,
            sustained_uplinks: sustained,
            ..AdrConfig::default()
        }
    }

    fn uplink(node_id: u32, fcnt: u32, sf: u8, payload: MacPayload) -> Frame {
        Frame {
            node_id,
            fcnt,
            start_time: fcnt as f64 * 10.0,
            airtime: 0.056576,
            sf,
            tx_power_dbm: 14.0,
            channel: 0,
            payload,
        }
    }

    #[test]
    fn dedup_accepts_first_copy_only() {
        let mut server = NetworkServer::new(AdrConfig::default());
        let f = uplink(1, 0, 7, MacPayload::Data);
        let (d1, _) = server.receive_uplink(&f, 0, 10.0);
        let (d2, _) = server.receive_uplink(&f, 1, 12.0);
        assert_eq!(d1, UplinkDisposition::Accepted);
        assert_eq!(d2, UplinkDisposition::Duplicate);
        assert_eq!(server.packets_received, 1);
    }

    #[test]
    fn sustained_margin_issues_exactly_one_request() {
        let n = 5;
        let mut server = NetworkServer::new(adr_config(n));
        // SF12 at 20 dB SNR: margin = 20 - (-20) - 10 = 30 dB, well positive.
        let mut command = None;
        for fcnt in 0..3 * n {
            let f = uplink(1, fcnt, 12, MacPayload::Data);
            let (_, cmd) = server.receive_uplink(&f, 0, 20.0);
            if let Some(cmd) = cmd {
                assert!(command.is_none(), "second request issued while one pending");
                command = Some(cmd);
            }
        }
        let cmd = command.expect("no ADR request issued");
        // 30 dB of margin at 3 dB per step: SF12 -> SF7 (DR5), 14 -> 2 dBm.
        assert_eq!(cmd.dr, 5);
        assert_eq!(cmd.power_index, 6);
        assert!(matches!(server.phase(1), AdrPhase::RequestSent { .. }));
        assert_eq!(server.adr_requests_issued, 1);

        // The ack returns the machine to idle.
        let ack = uplink(1, 3 * n, 7, MacPayload::DataWithAdrAck);
        server.receive_uplink(&ack, 0, 20.0);
        assert_eq!(server.phase(1), AdrPhase::Idle);
    }

    #[test]
    fn degraded_link_walks_power_then_sf_back_up() {
        let n = 4;
        let mut server = NetworkServer::new(adr_config(n));
        // SF7 at -25 dB SNR: margin = -25 + 7.5 - 10 = -27.5 dB.
        let mut command = None;
        for fcnt in 0..3 * n {
            let f = uplink(5, fcnt, 7, MacPayload::Data);
            let (_, cmd) = server.receive_uplink(&f, 0, -25.0);
            if let Some(cmd) = cmd {
                assert!(command.is_none(), "second request issued while one pending");
                command = Some(cmd);
            }
        }
        let cmd = command.expect("no recovery request issued");
        // The deficit raises power 14 -> 20 dBm first, then SF7 -> SF12.
        assert_eq!(cmd.power_index, 0);
        assert_eq!(cmd.dr, 0);
        assert!(matches!(server.phase(5), AdrPhase::RequestSent { .. }));

        let ack = uplink(5, 3 * n, 12, MacPayload::DataWithAdrAck);
        server.receive_uplink(&ack, 0, -25.0);
        assert_eq!(server.phase(5), AdrPhase::Idle);
    }

    #[test]
    fn margin_inside_the_deadband_never_triggers() {
        let mut server = NetworkServer::new(adr_config(3));
        for fcnt in 0..20 {
            // SF7 needs -7.5 dB; 5 dB SNR leaves a 2.5 dB surplus, less
            // than one 3 dB step in either direction.
            let f = uplink(2, fcnt, 7, MacPayload::Data);
            let (_, cmd) = server.receive_uplink(&f, 0, 5.0);
            assert!(cmd.is_none());
        }
        assert_eq!(server.phase(2), AdrPhase::Idle);
    }

    #[test]
    fn expired_downlink_reopens_the_machine() {
        let n = 2;
        let mut server = NetworkServer::new(adr_config(n));
        let mut issued = 0;
        for fcnt in 0..2 * n {
            let f = uplink(3, fcnt, 12, MacPayload::Data);
            if server.receive_uplink(&f, 0, 20.0).1.is_some() {
                issued += 1;
            }
        }
        assert_eq!(issued, 1);
        server.downlink_expired(3);
        assert_eq!(server.phase(3), AdrPhase::Idle);
        // Sustained margin can now trigger a second request.
        for fcnt in 2 * n..5 * n {
            let f = uplink(3, fcnt, 12, MacPayload::Data);
            if server.receive_uplink(&f, 0, 20.0).1.is_some() {
                issued += 1;
            }
        }
        assert_eq!(issued, 2);
    }

    #[test]
    fn disabled_adr_still_counts_deliveries() {
        let mut server = NetworkServer::new(AdrConfig::default());
        for fcnt in 0..50 {
            let f = uplink(4, fcnt, 12, MacPayload::Data);
            let (d, cmd) = server.receive_uplink(&f, 0, 20.0);
            assert_eq!(d, UplinkDisposition::Accepted);
            assert!(cmd.is_none());
        }
        assert_eq!(server.packets_received, 50);
    }
}
