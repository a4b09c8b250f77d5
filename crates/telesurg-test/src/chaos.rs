//! Network chaos simulation
//!
//! A one-way datagram path with hostile conditions:
//! - Latency and jitter
//! - Random and burst loss
//! - Duplication
//! - Blackouts (link cut)
//!
//! Reordering falls out of jitter: packets are delivered by arrival time, not
//! by send order. Everything is driven by explicit timestamps and a seeded RNG,
//! so a run is reproducible.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use telesurg_core::Timestamp;

/// Upper bound for any single jitter sample
const MAX_JITTER_MS: f64 = 1000.0;

/// Jitter distribution type
#[derive(Clone, Debug, PartialEq)]
pub enum JitterDistribution {
    None,
    Uniform { min_ms: f64, max_ms: f64 },
    /// Normal (mean, stddev), truncated at zero
    Normal { mean_ms: f64, stddev_ms: f64 },
    /// Heavy tail
    Pareto { scale_ms: f64, shape: f64 },
}

impl JitterDistribution {
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        let ms = match *self {
            JitterDistribution::None => 0.0,
            JitterDistribution::Uniform { min_ms, max_ms } => {
                if max_ms > min_ms {
                    rng.gen_range(min_ms..max_ms)
                } else {
                    min_ms
                }
            }
            JitterDistribution::Normal { mean_ms, stddev_ms } => {
                // Box-Muller; 1 - u keeps ln away from zero
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                mean_ms + stddev_ms * z
            }
            JitterDistribution::Pareto { scale_ms, shape } => {
                let u: f64 = 1.0 - rng.gen::<f64>();
                scale_ms / u.powf(1.0 / shape)
            }
        };
        Duration::from_secs_f64(ms.clamp(0.0, MAX_JITTER_MS) / 1000.0)
    }
}

/// Path conditions
#[derive(Clone, Debug, PartialEq)]
pub struct ChaosConfig {
    pub base_latency: Duration,
    pub jitter: JitterDistribution,
    /// Independent loss probability per packet
    pub loss_rate: f64,
    /// Probability that a packet starts a loss burst
    pub burst_loss_prob: f64,
    /// Burst length range, packets
    pub burst_length: (u32, u32),
    pub duplicate_prob: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::lan()
    }
}

impl ChaosConfig {
    /// Clean path with the given one-way latency
    pub fn ideal(latency: Duration) -> Self {
        ChaosConfig {
            base_latency: latency,
            jitter: JitterDistribution::None,
            loss_rate: 0.0,
            burst_loss_prob: 0.0,
            burst_length: (0, 0),
            duplicate_prob: 0.0,
        }
    }

    /// Same operating room network
    pub fn lan() -> Self {
        ChaosConfig {
            base_latency: Duration::from_micros(500),
            jitter: JitterDistribution::Uniform { min_ms: 0.0, max_ms: 0.5 },
            ..Self::ideal(Duration::ZERO)
        }
    }

    /// Hospital to hospital in one region
    pub fn regional() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(12),
            jitter: JitterDistribution::Normal {
                mean_ms: 2.0,
                stddev_ms: 1.0,
            },
            loss_rate: 0.002,
            burst_loss_prob: 0.0005,
            burst_length: (1, 3),
            duplicate_prob: 0.0005,
        }
    }

    /// Long-haul fiber between continents
    pub fn transcontinental() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(80),
            jitter: JitterDistribution::Normal {
                mean_ms: 5.0,
                stddev_ms: 2.0,
            },
            loss_rate: 0.005,
            burst_loss_prob: 0.001,
            burst_length: (2, 6),
            duplicate_prob: 0.001,
        }
    }

    /// Congested or wireless backhaul
    pub fn hostile() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(150),
            jitter: JitterDistribution::Pareto {
                scale_ms: 20.0,
                shape: 1.5,
            },
            loss_rate: 0.08,
            burst_loss_prob: 0.02,
            burst_length: (5, 20),
            duplicate_prob: 0.02,
        }
    }
}

#[derive(Clone, Debug)]
struct InFlight {
    data: Vec<u8>,
    sent_at: Timestamp,
    deliver_at: Timestamp,
    seq: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_lost: u64,
    pub packets_duplicated: u64,
    /// Delivered after a packet that was sent later
    pub packets_reordered: u64,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl ChaosStats {
    pub fn loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.packets_delivered == 0 {
            0.0
        } else {
            self.total_latency_us as f64 / self.packets_delivered as f64 / 1000.0
        }
    }
}

/// One direction of a simulated link
pub struct ChaosNetwork {
    config: ChaosConfig,
    rng: StdRng,
    in_flight: Vec<InFlight>,
    burst_remaining: u32,
    blackout: bool,
    next_seq: u64,
    highest_delivered: Option<u64>,
    stats: ChaosStats,
}

impl ChaosNetwork {
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        ChaosNetwork {
            config,
            rng: StdRng::seed_from_u64(seed),
            in_flight: Vec::new(),
            burst_remaining: 0,
            blackout: false,
            next_seq: 0,
            highest_delivered: None,
            stats: ChaosStats::default(),
        }
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Change conditions mid-run; packets already in flight keep their schedule
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// While set, every packet sent is lost
    pub fn set_blackout(&mut self, blackout: bool) {
        self.blackout = blackout;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    pub fn send(&mut self, data: &[u8], now: Timestamp) {
        self.stats.packets_sent += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.should_drop() {
            self.stats.packets_lost += 1;
            return;
        }

        let deliver_at = self.schedule(now);
        self.in_flight.push(InFlight {
            data: data.to_vec(),
            sent_at: now,
            deliver_at,
            seq,
        });

        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            let deliver_at = self.schedule(now);
            self.in_flight.push(InFlight {
                data: data.to_vec(),
                sent_at: now,
                deliver_at,
                seq,
            });
            self.stats.packets_duplicated += 1;
        }
    }

    fn schedule(&mut self, now: Timestamp) -> Timestamp {
        let jitter = self.config.jitter.sample(&mut self.rng);
        now.saturating_add(self.config.base_latency + jitter)
    }

    fn should_drop(&mut self) -> bool {
        if self.blackout {
            return true;
        }
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            return true;
        }
        if self.config.burst_loss_prob > 0.0 && self.rng.gen::<f64>() < self.config.burst_loss_prob {
            let (min, max) = self.config.burst_length;
            // this packet is the first of the burst
            self.burst_remaining = self.rng.gen_range(min..=max.max(min)).saturating_sub(1);
            return true;
        }
        self.rng.gen::<f64>() < self.config.loss_rate
    }

    /// Packets that have arrived by `now`, in arrival order
    pub fn deliver(&mut self, now: Timestamp) -> Vec<Vec<u8>> {
        let mut arrived = Vec::new();
        let mut i = 0;
        while i < self.in_flight.len() {
            if self.in_flight[i].deliver_at <= now {
                arrived.push(self.in_flight.swap_remove(i));
            } else {
                i += 1;
            }
        }
        arrived.sort_by_key(|p| (p.deliver_at, p.seq));

        let mut delivered = Vec::with_capacity(arrived.len());
        for packet in arrived {
            let latency = packet.deliver_at.since(packet.sent_at).as_micros() as u64;
            self.stats.packets_delivered += 1;
            self.stats.total_latency_us += latency;
            self.stats.max_latency_us = self.stats.max_latency_us.max(latency);
            match self.highest_delivered {
                Some(highest) if packet.seq < highest => self.stats.packets_reordered += 1,
                _ => self.highest_delivered = Some(packet.seq),
            }
            delivered.push(packet.data);
        }
        delivered
    }

    pub fn reset_stats(&mut self) {
        self.stats = ChaosStats::default();
    }
}
