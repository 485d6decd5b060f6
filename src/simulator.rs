//! Top-level fixed-step orchestration.
//!
//! The simulator owns every entity and advances time in fixed increments.
//! Within a step, every candidate transmission is collected before any
//! collision is resolved, so outcomes never depend on node iteration order;
//! the only order-sensitive ties (first accepted uplink copy, downlink
//! delivery order) follow gateway index and ready-time/enqueue order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::channel::MultiChannel;
use crate::config::SimulationConfig;
use crate::duty_cycle::DutyCycleManager;
use crate::error::{Error, Result};
use crate::gateway::{Gateway, GatewaySnapshot, Reception, RxVerdict};
use crate::lorawan::{compute_rx1, Frame, MacPayload};
use crate::mobility::{Position, SmoothMobility};
use crate::node::{Node, NodeSnapshot, TxOutcome};
use crate::server::{AdrCommand, NetworkServer, UplinkDisposition};
use crate::traffic::TrafficModel;

/// Payload size of a LinkADRReq downlink, bytes (MAC command frame).
const ADR_DOWNLINK_BYTES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimState {
    Setup,
    Running,
    Stopped,
}

/// Cumulative run statistics, updated every step.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Metrics {
    pub sent: u64,
    pub delivered: u64,
    pub collided: u64,
    pub lost_no_signal: u64,
    pub missed_downlinks: u64,
    pub adr_requests: u64,
    pub total_energy_j: f64,
    pub total_delay_s: f64,
    /// Delivered frames per spreading factor, SF7..SF12.
    pub delivered_by_sf: [u64; 6],
    /// Delivered frames per gateway, indexed by gateway id.
    pub delivered_by_gateway: Vec<u64>,
}

impl Metrics {
    pub fn pdr_percent(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.delivered as f64 / self.sent as f64 * 100.0
        }
    }

    pub fn avg_delay_s(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.total_delay_s / self.delivered as f64
        }
    }
}

/// Dashboard-facing view of the whole simulation at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSnapshot {
    pub time: f64,
    pub state: SimState,
    pub nodes: Vec<NodeSnapshot>,
    pub gateways: Vec<GatewaySnapshot>,
    pub metrics: Metrics,
}

pub struct Simulator {
    config: SimulationConfig,
    state: SimState,
    time: f64,
    nodes: Vec<Node>,
    gateways: Vec<Gateway>,
    server: NetworkServer,
    channels: MultiChannel,
    duty: DutyCycleManager,
    mobility_model: SmoothMobility,
    rng: StdRng,
    metrics: Metrics,
    stop_flag: Arc<AtomicBool>,
    wall_clock_budget: Option<Duration>,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut channels = MultiChannel::new(
            config.base_frequency_hz,
            config.channel_spacing_hz,
            config.num_channels,
            config.channel_distribution,
            config.channel_params.clone(),
        )?;

        // A single gateway sits at the area center; several are scattered.
        let gateways = (0..config.num_gateways)
            .map(|i| {
                let position = if config.num_gateways == 1 {
                    Position { x: config.area_size / 2.0, y: config.area_size / 2.0 }
                } else {
                    Position {
                        x: rng.gen::<f64>() * config.area_size,
                        y: rng.gen::<f64>() * config.area_size,
                    }
                };
                Gateway::new(i as u32, position)
            })
            .collect::<Vec<_>>();

        let mobility_model = SmoothMobility::new(
            config.area_size,
            config.mobility.min_speed,
            config.mobility.max_speed,
        );
        let traffic = TrafficModel::new(config.traffic_mode, config.packet_interval)?;

        let mut nodes = Vec::with_capacity(config.num_nodes);
        for i in 0..config.num_nodes {
            let position = Position {
                x: rng.gen::<f64>() * config.area_size,
                y: rng.gen::<f64>() * config.area_size,
            };
            let sf = config.fixed_sf.unwrap_or_else(|| rng.gen_range(7..=12));
            let tx_power = config.fixed_tx_power_dbm.unwrap_or(14.0);
            let channel = channels.select(&mut rng);
            let first_attempt = traffic.first_attempt(&mut rng);
            let mut node = Node::new(
                i as u32,
                position,
                sf,
                tx_power,
                channel,
                traffic.clone(),
                config.battery_capacity_j,
                config.energy_profile,
                first_attempt,
            );
            if config.mobility.enabled {
                node.mobility = Some(mobility_model.assign(position, &mut rng));
            }
            nodes.push(node);
        }

        let duty = DutyCycleManager::new(config.duty_cycle_limit, config.duty_cycle_window);
        let server = NetworkServer::new(config.adr.clone());
        let metrics = Metrics {
            delivered_by_gateway: vec![0; config.num_gateways],
            ..Metrics::default()
        };

        Ok(Simulator {
            config,
            state: SimState::Setup,
            time: 0.0,
            nodes,
            gateways,
            server,
            channels,
            duty,
            mobility_model,
            rng,
            metrics,
            stop_flag: Arc::new(AtomicBool::new(false)),
            wall_clock_budget: None,
        })
    }

    /// Flag checked once per step; setting it from another thread (ctrlc,
    /// dashboard stop button) ends the run after the current step.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Optional wall-clock budget for [`run`](Self::run), checked once per
    /// step, never mid-step.
    pub fn set_wall_clock_budget(&mut self, budget: Option<Duration>) {
        self.wall_clock_budget = budget;
    }

    /// Pin a node somewhere, for scenario construction. Rejected mid-run.
    pub fn set_node_position(&mut self, node_id: u32, x: f64, y: f64) -> Result<()> {
        self.ensure_not_running()?;
        let node = self
            .nodes
            .get_mut(node_id as usize)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown node {node_id}")))?;
        node.position = Position { x, y };
        node.initial_position = node.position;
        Ok(())
    }

    pub fn set_gateway_position(&mut self, gateway_id: u32, x: f64, y: f64) -> Result<()> {
        self.ensure_not_running()?;
        let gw = self
            .gateways
            .get_mut(gateway_id as usize)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown gateway {gateway_id}")))?;
        gw.position = Position { x, y };
        Ok(())
    }

    /// Live parameter changes are accepted only between runs.
    pub fn set_duty_cycle_limit(&mut self, limit: Option<f64>) -> Result<()> {
        self.ensure_not_running()?;
        if let Some(l) = limit {
            if !(l > 0.0 && l <= 1.0) {
                return Err(Error::invalid_parameter("duty_cycle_limit must be in (0, 1]"));
            }
        }
        self.config.duty_cycle_limit = limit;
        self.duty = DutyCycleManager::new(limit, self.config.duty_cycle_window);
        Ok(())
    }

    pub fn set_mobility_enabled(&mut self, enabled: bool) -> Result<()> {
        self.ensure_not_running()?;
        self.config.mobility.enabled = enabled;
        for node in self.nodes.iter_mut() {
            if enabled && node.mobility.is_none() {
                node.mobility = Some(self.mobility_model.assign(node.position, &mut self.rng));
            } else if !enabled {
                node.mobility = None;
            }
        }
        Ok(())
    }

    fn ensure_not_running(&self) -> Result<()> {
        if self.state == SimState::Running {
            return Err(Error::InvalidState("reconfiguration is only allowed between runs"));
        }
        Ok(())
    }

    /// Run the configured number of steps, honoring the stop flag and the
    /// wall-clock budget. Returns the cumulative metrics.
    pub fn run(&mut self) -> Metrics {
        self.state = SimState::Running;
        let started = Instant::now();
        for _ in 0..self.config.steps {
            if self.stop_flag.swap(false, Ordering::SeqCst) {
                log::info!("stop requested, ending run at t={:.1}", self.time);
                break;
            }
            if let Some(budget) = self.wall_clock_budget {
                if started.elapsed() > budget {
                    log::info!("wall-clock budget elapsed at t={:.1}", self.time);
                    break;
                }
            }
            self.step();
        }
        self.state = SimState::Stopped;
        self.metrics()
    }

    /// One fixed time increment: mobility, uplink collection, propagation,
    /// collision resolution, server handling, downlink delivery, metrics.
    pub fn step(&mut self) {
        let now = self.time;
        let dt = self.config.step_duration;

        // (1) advance mobile nodes
        if self.config.mobility.enabled {
            for node in self.nodes.iter_mut() {
                if let Some(state) = node.mobility.as_mut() {
                    node.position = self.mobility_model.advance(state, dt, &mut self.rng);
                }
            }
        }

        // (2) collect every candidate transmission before touching any gateway
        let mut frames: Vec<Frame> = Vec::new();
        for node in self.nodes.iter_mut() {
            let channel = self.channels.get(node.channel);
            if let Some(frame) = node.maybe_transmit(
                now,
                channel,
                &mut self.duty,
                self.config.payload_bytes,
                &mut self.rng,
            ) {
                frames.push(frame);
            }
        }
        self.metrics.sent += frames.len() as u64;

        // (3) propagate to every gateway inside the link-budget range
        for frame in &frames {
            let position = self.nodes[frame.node_id as usize].position;
            let channel = self.channels.get(frame.channel);
            let range = channel.max_range(frame.tx_power_dbm, frame.sf);
            for gw in self.gateways.iter_mut() {
                // The propagation model's reference distance is 1 m; closer
                // geometry is evaluated at the reference point.
                let distance = position.distance(&gw.position).max(1.0);
                if distance > range {
                    continue;
                }
                if let Ok((rssi, snr)) = channel.compute_rssi(frame.tx_power_dbm, distance, &mut self.rng)
                {
                    gw.collect(Reception { frame: frame.clone(), rssi, snr });
                }
            }
        }

        // (4) resolve collisions per gateway
        let capture = self.config.channel_params.capture_threshold_db;
        let mut survivors: HashMap<u32, Vec<(u32, f64)>> = HashMap::new();
        let mut interfered: HashSet<u32> = HashSet::new();
        for gw in self.gateways.iter_mut() {
            for (rx, verdict) in gw.resolve_collisions(capture) {
                match verdict {
                    RxVerdict::Delivered => {
                        survivors
                            .entry(rx.frame.node_id)
                            .or_default()
                            .push((gw.id, rx.snr));
                    }
                    RxVerdict::Interfered => {
                        interfered.insert(rx.frame.node_id);
                    }
                    RxVerdict::BelowFloor => {}
                }
            }
        }

        // (5) per-frame outcome, forwarding survivors to the network server
        for frame in &frames {
            match survivors.get(&frame.node_id) {
                Some(copies) => {
                    self.metrics.delivered += 1;
                    self.metrics.delivered_by_sf[(frame.sf - 7) as usize] += 1;
                    self.metrics.total_delay_s += frame.airtime;
                    let mut accepting_gw = None;
                    for (gw_id, snr) in copies {
                        let (disposition, command) =
                            self.server.receive_uplink(frame, *gw_id, *snr);
                        if disposition == UplinkDisposition::Accepted {
                            accepting_gw = Some(*gw_id);
                        }
                        if let Some(command) = command {
                            self.schedule_adr_downlink(frame, command);
                        }
                    }
                    if let Some(gw_id) = accepting_gw {
                        self.metrics.delivered_by_gateway[gw_id as usize] += 1;
                        self.gateways[gw_id as usize].delivered += 1;
                    }
                    self.nodes[frame.node_id as usize].record_outcome(TxOutcome::Delivered);
                }
                None => {
                    // Collision only when some gateway actually heard the
                    // frame and lost it to interference there; anything
                    // else never made it past the channel.
                    let outcome = if interfered.contains(&frame.node_id) {
                        TxOutcome::Collided
                    } else {
                        TxOutcome::NoSignal
                    };
                    match outcome {
                        TxOutcome::Collided => self.metrics.collided += 1,
                        _ => self.metrics.lost_no_signal += 1,
                    }
                    self.nodes[frame.node_id as usize].record_outcome(outcome);
                }
            }
        }

        // (6) deliver due downlinks inside receive windows
        for gw_index in 0..self.gateways.len() {
            for downlink in self.gateways[gw_index].deliver_due(now) {
                let node = &mut self.nodes[downlink.node_id as usize];
                if node.in_receive_window(now) {
                    node.receive_downlink(&downlink);
                } else {
                    self.metrics.missed_downlinks += 1;
                    self.server.downlink_expired(downlink.node_id);
                }
            }
        }

        self.metrics.adr_requests = self.server.adr_requests_issued;
        self.time += dt;
    }

    fn schedule_adr_downlink(&mut self, uplink: &Frame, command: AdrCommand) {
        let channel = self.channels.get(uplink.channel);
        let ready_time = compute_rx1(uplink.end_time());
        let downlink = Frame {
            node_id: command.node_id,
            fcnt: command.fcnt_down,
            start_time: ready_time,
            airtime: channel.airtime(uplink.sf, ADR_DOWNLINK_BYTES),
            sf: uplink.sf,
            tx_power_dbm: 14.0,
            channel: uplink.channel,
            payload: MacPayload::AdrRequest {
                dr: command.dr,
                power_index: command.power_index,
            },
        };
        self.gateways[command.gateway_id as usize].enqueue_downlink(downlink, ready_time);
    }

    /// Current cumulative metrics, energy included.
    pub fn metrics(&self) -> Metrics {
        let mut m = self.metrics.clone();
        m.total_energy_j = self
            .nodes
            .iter()
            .map(|n| n.energy_tx_j + n.energy_rx_j)
            .sum();
        m.adr_requests = self.server.adr_requests_issued;
        m
    }

    /// Step-by-step state view for external visualization layers.
    pub fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            time: self.time,
            state: self.state,
            nodes: self.nodes.iter().map(NodeSnapshot::from).collect(),
            gateways: self.gateways.iter().map(GatewaySnapshot::from).collect(),
            metrics: self.metrics(),
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn gateways(&self) -> &[Gateway] {
        &self.gateways
    }

    pub fn server(&self) -> &NetworkServer {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::TrafficMode;

    fn quiet_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.traffic_mode = TrafficMode::Periodic;
        config.duty_cycle_limit = None;
        config.seed = Some(1);
        config
    }

    #[test]
    fn construction_rejects_bad_config() {
        let mut config = quiet_config();
        config.num_nodes = 0;
        assert!(Simulator::new(config).is_err());
    }

    #[test]
    fn run_reaches_stopped_state() {
        let mut config = quiet_config();
        config.num_nodes = 3;
        config.steps = 20;
        let mut sim = Simulator::new(config).unwrap();
        assert_eq!(sim.state(), SimState::Setup);
        sim.run();
        assert_eq!(sim.state(), SimState::Stopped);
        assert!((sim.time() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn stop_flag_ends_the_run_early() {
        let mut config = quiet_config();
        config.steps = 1000;
        let mut sim = Simulator::new(config).unwrap();
        sim.stop();
        sim.run();
        // The flag was set before the first step, so nothing happened.
        assert_eq!(sim.metrics().sent, 0);
    }

    #[test]
    fn reconfiguration_allowed_between_runs_only() {
        let mut sim = Simulator::new(quiet_config()).unwrap();
        assert!(sim.set_duty_cycle_limit(Some(0.1)).is_ok());
        assert!(sim.set_duty_cycle_limit(Some(2.0)).is_err());
        sim.run();
        assert!(sim.set_mobility_enabled(true).is_ok());
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let mut config = quiet_config();
        config.num_nodes = 2;
        config.steps = 5;
        let mut sim = Simulator::new(config).unwrap();
        sim.run();
        let snap = sim.snapshot();
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(snap.gateways.len(), 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"recent_pdr\""));
    }

    #[test]
    fn energy_accumulates_per_transmission() {
        let mut config = quiet_config();
        config.num_nodes = 1;
        config.steps = 30;
        config.packet_interval = 10.0;
        config.fixed_sf = Some(7);
        let mut sim = Simulator::new(config).unwrap();
        let metrics = sim.run();
        assert_eq!(metrics.sent, 3);
        // Three transmissions at 14 dBm for 56.576 ms each.
        let expected = 3.0 * 10f64.powf(1.4) / 1000.0 * 0.056576;
        assert!((metrics.total_energy_j - expected).abs() < 1e-9);
    }
}
