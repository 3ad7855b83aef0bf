//! Lossy acyclic field-bus link
//!
//! Simulates what the acyclic channel does to authority messages:
//! - Latency and jitter
//! - Random and burst loss
//! - Reordering
//! - Duplication

use std::collections::VecDeque;

use helm_core::Millis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Link behaviour
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub base_latency_ms: Millis,
    /// Uniform extra delay in `0..=jitter_ms`
    pub jitter_ms: Millis,
    /// Probability (0.0 - 1.0) that a message is dropped
    pub loss_rate: f64,
    /// Probability that a drop starts a burst
    pub burst_loss_prob: f64,
    pub burst_length: (u32, u32),
    /// Probability that a message jumps ahead of queued ones
    pub reorder_prob: f64,
    pub reorder_depth: u32,
    pub duplicate_prob: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            base_latency_ms: 5,
            jitter_ms: 5,
            loss_rate: 0.01,
            burst_loss_prob: 0.01,
            burst_length: (2, 4),
            reorder_prob: 0.02,
            reorder_depth: 2,
            duplicate_prob: 0.01,
        }
    }
}

impl LinkConfig {
    /// Lossless, in-order, fixed latency
    pub fn perfect() -> Self {
        LinkConfig {
            base_latency_ms: 2,
            jitter_ms: 0,
            loss_rate: 0.0,
            burst_loss_prob: 0.0,
            burst_length: (0, 0),
            reorder_prob: 0.0,
            reorder_depth: 0,
            duplicate_prob: 0.0,
        }
    }

    /// Noisy plant floor: frequent loss, reordering and duplicates
    pub fn hostile() -> Self {
        LinkConfig {
            base_latency_ms: 20,
            jitter_ms: 80,
            loss_rate: 0.15,
            burst_loss_prob: 0.05,
            burst_length: (3, 10),
            reorder_prob: 0.2,
            reorder_depth: 5,
            duplicate_prob: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
struct InFlight<T> {
    message: T,
    deliver_at: Millis,
    sent_at: Millis,
}

/// Link statistics
#[derive(Clone, Debug, Default)]
pub struct LinkStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub reordered: u64,
    pub duplicated: u64,
    pub max_latency_ms: Millis,
}

impl LinkStats {
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }
}

/// One direction of a simulated link
pub struct Link<T> {
    config: LinkConfig,
    rng: StdRng,
    in_flight: VecDeque<InFlight<T>>,
    burst_remaining: u32,
    /// While cut, every message is dropped
    cut: bool,
    stats: LinkStats,
}

impl<T: Clone> Link<T> {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        Link {
            config,
            rng: StdRng::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            burst_remaining: 0,
            cut: false,
            stats: LinkStats::default(),
        }
    }

    /// Queue a message sent at `now`
    pub fn send(&mut self, now: Millis, message: T) {
        self.stats.sent += 1;

        if self.should_drop() {
            self.stats.lost += 1;
            return;
        }

        let deliver_at = now + self.latency();
        let packet = InFlight {
            message,
            deliver_at,
            sent_at: now,
        };

        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            let mut dup = packet.clone();
            dup.deliver_at += self.latency();
            self.in_flight.push_back(dup);
            self.stats.duplicated += 1;
        }

        if !self.in_flight.is_empty() && self.rng.gen::<f64>() < self.config.reorder_prob {
            let depth = self.config.reorder_depth.min(self.in_flight.len() as u32);
            let back = self.rng.gen_range(0..=depth) as usize;
            let pos = self.in_flight.len() - back;
            self.in_flight.insert(pos, packet);
            self.stats.reordered += 1;
        } else {
            self.in_flight.push_back(packet);
        }
    }

    /// Messages due at `now`, in queue order
    pub fn poll(&mut self, now: Millis) -> Vec<T> {
        let mut delivered = Vec::new();
        let mut pending = VecDeque::with_capacity(self.in_flight.len());

        for packet in self.in_flight.drain(..) {
            if packet.deliver_at <= now {
                let latency = now - packet.sent_at;
                self.stats.delivered += 1;
                self.stats.max_latency_ms = self.stats.max_latency_ms.max(latency);
                delivered.push(packet.message);
            } else {
                pending.push_back(packet);
            }
        }

        self.in_flight = pending;
        delivered
    }

    /// Drop everything in flight and everything sent until [`restore`](Self::restore)
    pub fn cut(&mut self) {
        self.cut = true;
        self.stats.lost += self.in_flight.len() as u64;
        self.in_flight.clear();
    }

    pub fn restore(&mut self) {
        self.cut = false;
    }

    pub fn is_cut(&self) -> bool {
        self.cut
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    fn latency(&mut self) -> Millis {
        let jitter = if self.config.jitter_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=self.config.jitter_ms)
        };
        self.config.base_latency_ms + jitter
    }

    fn should_drop(&mut self) -> bool {
        if self.cut {
            return true;
        }

        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            return true;
        }

        if self.rng.gen::<f64>() < self.config.burst_loss_prob {
            let (min, max) = self.config.burst_length;
            self.burst_remaining = self.rng.gen_range(min..=max);
            return true;
        }

        self.rng.gen::<f64>() < self.config.loss_rate
    }
}
