//! Regulatory duty-cycle enforcement.
//!
//! Per-node ledger of past transmission intervals over a trailing window.
//! A transmission is admitted only if the busy time inside the window,
//! including the new frame, stays under `limit * window`.

use std::collections::HashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct TxInterval {
    start: f64,
    airtime: f64,
}

impl TxInterval {
    fn end(&self) -> f64 {
        self.start + self.airtime
    }

    /// Portion of this interval inside [from, to].
    fn overlap(&self, from: f64, to: f64) -> f64 {
        (self.end().min(to) - self.start.max(from)).max(0.0)
    }
}

#[derive(Debug)]
pub struct DutyCycleManager {
    /// None disables the constraint entirely.
    limit: Option<f64>,
    window: f64,
    ledger: HashMap<u32, VecDeque<TxInterval>>,
}

impl DutyCycleManager {
    pub fn new(limit: Option<f64>, window: f64) -> Self {
        DutyCycleManager { limit, window, ledger: HashMap::new() }
    }

    pub fn limit(&self) -> Option<f64> {
        self.limit
    }

    /// Busy time of `node_id` within [now - window, now].
    pub fn busy_time(&self, node_id: u32, now: f64) -> f64 {
        let from = now - self.window;
        self.ledger
            .get(&node_id)
            .map(|q| q.iter().map(|tx| tx.overlap(from, now)).sum())
            .unwrap_or(0.0)
    }

    pub fn may_transmit(&mut self, node_id: u32, now: f64, requested_airtime: f64) -> bool {
        let Some(limit) = self.limit else { return true };
        self.prune(node_id, now);
        (self.busy_time(node_id, now) + requested_airtime) / self.window <= limit
    }

    pub fn record_transmission(&mut self, node_id: u32, start: f64, airtime: f64) {
        if self.limit.is_none() {
            return;
        }
        self.ledger
            .entry(node_id)
            .or_default()
            .push_back(TxInterval { start, airtime });
    }

    /// Earliest future time at which a frame of `requested_airtime` fits.
    /// Busy time drains linearly as old intervals slide past the trailing
    /// edge of the window, so the answer falls inside the drain span of one
    /// of the recorded intervals, walked oldest first.
    pub fn next_available_time(&self, node_id: u32, now: f64, requested_airtime: f64) -> f64 {
        let Some(limit) = self.limit else { return now };
        let budget = limit * self.window;
        let Some(queue) = self.ledger.get(&node_id) else { return now };

        let mut needed = self.busy_time(node_id, now) + requested_airtime - budget;
        if needed <= 0.0 {
            return now;
        }
        let horizon = now - self.window;
        for tx in queue.iter() {
            let contribution = tx.overlap(horizon, now);
            if contribution <= 0.0 {
                continue;
            }
            // This interval drains from `drain_start` to `end + window`.
            let drain_start = tx.start.max(horizon) + self.window;
            if needed <= contribution {
                return now.max(drain_start + needed);
            }
            needed -= contribution;
        }
        // Unreachable unless the request exceeds the whole budget; then the
        // frame fits only once the ledger is empty.
        queue.back().map(|tx| tx.end() + self.window).unwrap_or(now)
    }

    fn prune(&mut self, node_id: u32, now: f64) {
        let horizon = now - self.window;
        if let Some(queue) = self.ledger.get_mut(&node_id) {
            while queue.front().map(|tx| tx.end() < horizon).unwrap_or(false) {
                queue.pop_front();
            }
        }
    }
}
