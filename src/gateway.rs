//! Gateway receiver: per-step in-flight set, collision and capture
//! resolution, and the downlink queue.
//!
//! Collision rules follow the lorasim / FLoRa receivers: frames interfere
//! only when they overlap in time on the same channel with the same
//! spreading factor; a frame clear of every interferer by the capture
//! threshold survives, otherwise the whole cluster is lost.

use serde::Serialize;

use crate::channel::required_snr;
use crate::lorawan::Frame;
use crate::mobility::Position;

/// One candidate reception at this gateway for the current step.
#[derive(Debug, Clone)]
pub struct Reception {
    pub frame: Frame,
    pub rssi: f64,
    pub snr: f64,
}

/// How one reception fared after the step's collision resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    Delivered,
    /// Lost to an overlapping same-channel, same-SF transmission.
    Interfered,
    /// Clear of interferers but under the demodulation SNR floor.
    BelowFloor,
}

#[derive(Debug, Clone)]
struct QueuedDownlink {
    ready_time: f64,
    seq: u64,
    frame: Frame,
}

#[derive(Debug)]
pub struct Gateway {
    pub id: u32,
    pub position: Position,
    in_flight: Vec<Reception>,
    downlink_queue: Vec<QueuedDownlink>,
    downlink_seq: u64,
    pub delivered: u64,
}

impl Gateway {
    pub fn new(id: u32, position: Position) -> Self {
        Gateway {
            id,
            position,
            in_flight: Vec::new(),
            downlink_queue: Vec::new(),
            downlink_seq: 0,
            delivered: 0,
        }
    }

    /// Accumulate a candidate reception for this step.
    pub fn collect(&mut self, reception: Reception) {
        self.in_flight.push(reception);
    }

    /// Resolve the step's in-flight set, clearing it. Returns every frame
    /// with its verdict.
    pub fn resolve_collisions(&mut self, capture_threshold_db: f64) -> Vec<(Reception, RxVerdict)> {
        let frames = std::mem::take(&mut self.in_flight);
        let mut results = Vec::with_capacity(frames.len());
        for (i, rx) in frames.iter().enumerate() {
            let mut strongest_interferer = f64::NEG_INFINITY;
            for (j, other) in frames.iter().enumerate() {
                if i == j {
                    continue;
                }
                let interferes = rx.frame.overlaps(&other.frame)
                    && rx.frame.channel == other.frame.channel
                    && rx.frame.sf == other.frame.sf;
                if interferes && other.rssi > strongest_interferer {
                    strongest_interferer = other.rssi;
                }
            }
            let captured = strongest_interferer == f64::NEG_INFINITY
                || rx.rssi - strongest_interferer > capture_threshold_db;
            let verdict = if !captured {
                RxVerdict::Interfered
            } else if rx.snr < required_snr(rx.frame.sf) {
                RxVerdict::BelowFloor
            } else {
                RxVerdict::Delivered
            };
            results.push((rx.clone(), verdict));
        }
        results
    }

    /// Queue a downlink for delivery no earlier than `ready_time`.
    pub fn enqueue_downlink(&mut self, frame: Frame, ready_time: f64) {
        self.downlink_queue.push(QueuedDownlink {
            ready_time,
            seq: self.downlink_seq,
            frame,
        });
        self.downlink_seq += 1;
    }

    /// Pop all downlinks whose ready time has passed, in ready-time order
    /// with ties broken by enqueue order.
    pub fn deliver_due(&mut self, now: f64) -> Vec<Frame> {
        let mut due: Vec<QueuedDownlink> = Vec::new();
        let mut remaining = Vec::with_capacity(self.downlink_queue.len());
        for entry in self.downlink_queue.drain(..) {
            if entry.ready_time <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.downlink_queue = remaining;
        due.sort_by(|a, b| {
            a.ready_time
                .partial_cmp(&b.ready_time)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        due.into_iter().map(|e| e.frame).collect()
    }

    pub fn pending_downlinks(&self) -> usize {
        self.downlink_queue.len()
    }
}

/// Dashboard-facing view of one gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub delivered: u64,
    pub pending_downlinks: usize,
}

impl From<&Gateway> for GatewaySnapshot {
    fn from(gw: &Gateway) -> Self {
        GatewaySnapshot {
            id: gw.id,
            x: gw.position.x,
            y: gw.position.y,
            delivered: gw.delivered,
            pending_downlinks: gw.pending_downlinks(),
        }
    }
}
