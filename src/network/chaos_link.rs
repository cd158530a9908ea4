//! An in-memory, tick-driven lossy link for exercising [`ReliableChannel`].
//!
//! [`ChaosLink`] implements [`Transport`] and holds packets "in flight" for a
//! configurable number of ticks, dropping, duplicating and reordering them
//! from a seeded [`Pcg32`]. The same seed always produces the same fault
//! pattern, so failures reproduce.
//!
//! ```
//! use rollback_netplay::{ChaosConfig, ChaosLink, ChannelConfig, ChannelEvent, ReliableChannel};
//!
//! let config = ChaosConfig::builder().loss_rate(0.3).latency_ticks(2).seed(7).build();
//! let mut link = ChaosLink::new(config);
//! let mut sender = ReliableChannel::<u32>::new(ChannelConfig::default());
//! sender.send(42).unwrap();
//! sender.send_all_packets(&mut link);
//! let _arrived = link.advance();
//! ```
//!
//! [`ReliableChannel`]: crate::ReliableChannel

use crate::rng::Pcg32;
use crate::{ChannelPacket, Transport};

/// Fault injection settings. All rates default to 0.0 and all delays to zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Ticks every packet spends in flight (default: 0).
    pub latency_ticks: u32,

    /// Extra random delay, uniform in `0..=jitter_ticks` (default: 0).
    /// Unequal delays reorder packets.
    pub jitter_ticks: u32,

    /// Probability of dropping a packet (0.0 - 1.0, default: 0.0).
    pub loss_rate: f64,

    /// Probability of delivering a packet twice (0.0 - 1.0, default: 0.0).
    pub duplication_rate: f64,

    /// Packets collected before a reorder pass (default: 0, disabled).
    pub reorder_buffer_size: usize,

    /// Probability of swapping each buffered packet with a random one
    /// (0.0 - 1.0, default: 0.0).
    pub reorder_rate: f64,

    /// Probability of starting a burst loss (0.0 - 1.0, default: 0.0).
    pub burst_loss_probability: f64,

    /// Consecutive packets dropped per burst (default: 0).
    pub burst_loss_length: usize,

    /// Seed for the fault pattern (default: 0).
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            latency_ticks: 0,
            jitter_ticks: 0,
            loss_rate: 0.0,
            duplication_rate: 0.0,
            reorder_buffer_size: 0,
            reorder_rate: 0.0,
            burst_loss_probability: 0.0,
            burst_loss_length: 0,
            seed: 0,
        }
    }
}

impl ChaosConfig {
    /// Creates a new builder for fluent configuration.
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::default()
    }

    /// Perfect link: everything arrives on the next tick, in order.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Uniform loss at `rate`.
    pub fn lossy(rate: f64) -> Self {
        Self {
            loss_rate: rate.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Loss, jitter, duplication and reordering together.
    pub fn terrible_network() -> Self {
        Self {
            latency_ticks: 3,
            jitter_ticks: 4,
            loss_rate: 0.15,
            duplication_rate: 0.05,
            reorder_buffer_size: 5,
            reorder_rate: 0.1,
            burst_loss_probability: 0.01,
            burst_loss_length: 4,
            seed: 0,
        }
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Sets the fixed delay.
    pub fn latency_ticks(mut self, ticks: u32) -> Self {
        self.config.latency_ticks = ticks;
        self
    }

    /// Sets the random extra delay.
    pub fn jitter_ticks(mut self, ticks: u32) -> Self {
        self.config.jitter_ticks = ticks;
        self
    }

    /// Sets the loss rate.
    pub fn loss_rate(mut self, rate: f64) -> Self {
        self.config.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the duplication rate.
    pub fn duplication_rate(mut self, rate: f64) -> Self {
        self.config.duplication_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets reorder buffering.
    pub fn reorder(mut self, buffer_size: usize, rate: f64) -> Self {
        self.config.reorder_buffer_size = buffer_size;
        self.config.reorder_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets burst loss parameters.
    pub fn burst_loss(mut self, probability: f64, length: usize) -> Self {
        self.config.burst_loss_probability = probability.clamp(0.0, 1.0);
        self.config.burst_loss_length = length;
        self
    }

    /// Sets the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters describing what the link did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Packets handed to the link.
    pub packets_sent: u64,
    /// Packets dropped by uniform loss.
    pub packets_dropped: u64,
    /// Packets dropped by burst loss.
    pub packets_dropped_burst: u64,
    /// Extra copies scheduled.
    pub packets_duplicated: u64,
    /// Swaps performed by the reorder pass.
    pub packets_reordered: u64,
    /// Packets handed back by [`ChaosLink::advance`].
    pub packets_delivered: u64,
}

#[derive(Debug)]
struct InFlight<M> {
    deliver_at: u64,
    packet: ChannelPacket<M>,
}

/// One direction of a simulated network path.
#[derive(Debug)]
pub struct ChaosLink<M> {
    config: ChaosConfig,
    rng: Pcg32,
    now: u64,
    in_flight: Vec<InFlight<M>>,
    reorder_buffer: Vec<ChannelPacket<M>>,
    burst_remaining: usize,
    stats: ChaosStats,
}

impl<M: Clone> ChaosLink<M> {
    /// Creates an empty link.
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            rng: Pcg32::seed_from_u64(config.seed),
            config,
            now: 0,
            in_flight: Vec::new(),
            reorder_buffer: Vec::new(),
            burst_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Replaces the configuration; packets already in flight keep their schedule.
    pub fn set_config(&mut self, config: ChaosConfig) {
        self.config = config;
    }

    /// What the link has done so far.
    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    /// Packets scheduled but not yet delivered.
    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len() + self.reorder_buffer.len()
    }

    fn chance(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen_bool(rate)
    }

    fn drop_for_burst(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        if self.config.burst_loss_length > 0 && self.chance(self.config.burst_loss_probability) {
            self.burst_remaining = self.config.burst_loss_length - 1;
            self.stats.packets_dropped_burst += 1;
            return true;
        }
        false
    }

    fn schedule(&mut self, packet: ChannelPacket<M>) {
        let jitter = if self.config.jitter_ticks > 0 {
            self.rng.gen_range(0..self.config.jitter_ticks + 1)
        } else {
            0
        };
        let deliver_at = self.now + 1 + u64::from(self.config.latency_ticks) + u64::from(jitter);
        self.in_flight.push(InFlight { deliver_at, packet });
    }

    /// Moves time forward one tick and returns whatever arrives.
    pub fn advance(&mut self) -> Vec<ChannelPacket<M>> {
        self.now += 1;
        let now = self.now;

        // Stable partition keeps send order among packets due on the same tick.
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|flight| flight.deliver_at <= now);
        self.in_flight = pending;

        let mut arrived: Vec<ChannelPacket<M>> = due.into_iter().map(|flight| flight.packet).collect();
        self.reorder(&mut arrived);
        self.stats.packets_delivered += arrived.len() as u64;
        arrived
    }

    /// Delivers everything still in flight, ignoring schedules.
    pub fn drain(&mut self) -> Vec<ChannelPacket<M>> {
        let mut arrived: Vec<ChannelPacket<M>> = std::mem::take(&mut self.reorder_buffer);
        arrived.extend(self.in_flight.drain(..).map(|flight| flight.packet));
        self.stats.packets_delivered += arrived.len() as u64;
        arrived
    }

    fn reorder(&mut self, arrived: &mut Vec<ChannelPacket<M>>) {
        if self.config.reorder_buffer_size == 0 || self.config.reorder_rate <= 0.0 {
            return;
        }
        self.reorder_buffer.append(arrived);
        if self.reorder_buffer.len() < self.config.reorder_buffer_size {
            return;
        }
        let len = self.reorder_buffer.len() as u32;
        for i in 0..self.reorder_buffer.len() {
            if self.chance(self.config.reorder_rate) {
                let j = self.rng.gen_range(0..len) as usize;
                if i != j {
                    self.reorder_buffer.swap(i, j);
                    self.stats.packets_reordered += 1;
                }
            }
        }
        arrived.append(&mut self.reorder_buffer);
    }
}

impl<M: Clone> Transport<M> for ChaosLink<M> {
    fn send_raw(&mut self, packet: &ChannelPacket<M>) {
        self.stats.packets_sent += 1;

        if self.drop_for_burst() {
            return;
        }
        if self.chance(self.config.loss_rate) {
            self.stats.packets_dropped += 1;
            return;
        }

        self.schedule(packet.clone());
        if self.chance(self.config.duplication_rate) {
            self.stats.packets_duplicated += 1;
            self.schedule(packet.clone());
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn data(sequence: u32) -> ChannelPacket<u32> {
        ChannelPacket::Data {
            sequence,
            message: sequence,
        }
    }

    #[test]
    fn passthrough_delivers_next_tick_in_order() {
        let mut link = ChaosLink::new(ChaosConfig::passthrough());
        for sequence in 1..=3 {
            link.send_raw(&data(sequence));
        }
        assert_eq!(link.advance(), vec![data(1), data(2), data(3)]);
        assert!(link.advance().is_empty());
    }

    #[test]
    fn latency_holds_packets() {
        let mut link = ChaosLink::new(ChaosConfig::builder().latency_ticks(2).build());
        link.send_raw(&data(1));
        assert!(link.advance().is_empty());
        assert!(link.advance().is_empty());
        assert_eq!(link.advance(), vec![data(1)]);
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut link = ChaosLink::new(ChaosConfig::lossy(1.0));
        for sequence in 0..10 {
            link.send_raw(&data(sequence));
        }
        assert!(link.advance().is_empty());
        assert_eq!(link.stats().packets_dropped, 10);
    }

    #[test]
    fn same_seed_same_faults() {
        let config = ChaosConfig {
            seed: 99,
            ..ChaosConfig::terrible_network()
        };
        let run = |config: ChaosConfig| {
            let mut link = ChaosLink::new(config);
            let mut seen = Vec::new();
            for sequence in 0..200 {
                link.send_raw(&data(sequence));
                seen.extend(link.advance());
            }
            seen.extend(link.drain());
            seen
        };
        assert_eq!(run(config.clone()), run(config));
    }

    #[test]
    fn burst_loss_drops_consecutive_packets() {
        let mut link = ChaosLink::new(ChaosConfig::builder().burst_loss(1.0, 3).build());
        for sequence in 0..3 {
            link.send_raw(&data(sequence));
        }
        assert_eq!(link.stats().packets_dropped_burst, 3);
        assert!(link.advance().is_empty());
    }

    #[test]
    fn duplication_doubles_delivery() {
        let mut link = ChaosLink::new(ChaosConfig::builder().duplication_rate(1.0).build());
        link.send_raw(&data(5));
        assert_eq!(link.advance(), vec![data(5), data(5)]);
    }
}
