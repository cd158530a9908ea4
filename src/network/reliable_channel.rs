//! Go-Back-N reliable, in-order delivery over a lossy datagram [`Transport`].
//!
//! The channel is a request-driven protocol object: the owner feeds it
//! [`send`](ReliableChannel::send), [`recv`](ReliableChannel::recv) and a
//! periodic [`on_tick`](ReliableChannel::on_tick), then moves queued packets
//! to the wire with [`send_all_packets`](ReliableChannel::send_all_packets)
//! and drains [`events`](ReliableChannel::events).
//!
//! Sequence numbers are 32-bit and never wrap; a session that sends more than
//! `u32::MAX` reliable packets is not supported.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use tracing::{debug, trace};
use web_time::Duration;

use crate::network::codec;
use crate::report_violation;
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{debug_check_invariants, ChannelConfig, NetplayError, Transport};

/// One datagram on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPacket<M> {
    /// A whole reliable message.
    Data {
        /// Position in the reliable stream.
        sequence: u32,
        /// The message.
        message: M,
    },
    /// One piece of a reliable message whose encoding exceeded the MTU.
    Fragment {
        /// Position in the reliable stream; each fragment has its own.
        sequence: u32,
        /// Zero-based piece number.
        index: u32,
        /// Total number of pieces.
        count: u32,
        /// Encoded bytes of this piece.
        bytes: Vec<u8>,
    },
    /// Cumulative acknowledgement of everything up to `sequence`.
    Ack {
        /// Highest in-order sequence received.
        sequence: u32,
    },
    /// Liveness probe sent while nothing is outstanding.
    KeepAlive,
    /// Fire-and-forget message outside the reliable stream.
    Unreliable(M),
}

impl<M> ChannelPacket<M> {
    /// Reliable stream position, for `Data` and `Fragment` packets.
    #[must_use]
    pub fn sequence(&self) -> Option<u32> {
        match self {
            Self::Data { sequence, .. } | Self::Fragment { sequence, .. } => Some(*sequence),
            Self::Ack { .. } | Self::KeepAlive | Self::Unreliable(_) => None,
        }
    }
}

/// Something the owner has to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent<M> {
    /// The next reliable message, in order, exactly once.
    Delivered(M),
    /// An unreliable message, as received.
    Unreliable(M),
    /// Nothing was heard from the peer for the keepalive period. The timer is
    /// stopped; the owner decides whether to tear the channel down.
    TimedOut,
}

/// Go-Back-N sender and receiver for one peer.
///
/// Every reliable message is retransmitted round-robin, one per tick, until a
/// cumulative ACK covers it. The receiver accepts only the next expected
/// sequence and re-ACKs anything else, so duplicates and reordering are
/// absorbed without buffering.
#[derive(Debug)]
pub struct ReliableChannel<M> {
    config: ChannelConfig,
    send_sequence: u32,
    recv_sequence: u32,
    ack_sequence: u32,
    send_list: VecDeque<ChannelPacket<M>>,
    cursor: usize,
    countdown: u32,
    skip_next_keep_alive: bool,
    timer_running: bool,
    outbox: VecDeque<ChannelPacket<M>>,
    events: VecDeque<ChannelEvent<M>>,
    reassembly: Vec<u8>,
}

impl<M> ReliableChannel<M>
where
    M: Clone + Serialize + DeserializeOwned,
{
    /// Creates an idle channel. The timer starts on the first send or receive.
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            countdown: config.keep_alive_ticks().unwrap_or(0),
            config,
            send_sequence: 0,
            recv_sequence: 0,
            ack_sequence: 0,
            send_list: VecDeque::new(),
            cursor: 0,
            skip_next_keep_alive: false,
            timer_running: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            reassembly: Vec::new(),
        }
    }

    /// Queues `message` for reliable delivery and transmits it once right away.
    ///
    /// Messages whose encoding exceeds the configured MTU are split into
    /// fragments, each taking its own sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`NetplayError::SerializationError`] if the message cannot be
    /// encoded to measure its size.
    pub fn send(&mut self, message: M) -> Result<(), NetplayError> {
        let bytes = codec::encode(&message)?;
        if bytes.len() <= self.config.mtu {
            self.send_sequence += 1;
            self.enqueue(ChannelPacket::Data {
                sequence: self.send_sequence,
                message,
            });
        } else {
            let count = bytes.len().div_ceil(self.config.mtu) as u32;
            debug!(
                "Fragmenting {} bytes into {} packets (mtu={})",
                bytes.len(),
                count,
                self.config.mtu
            );
            for (index, chunk) in bytes.chunks(self.config.mtu).enumerate() {
                self.send_sequence += 1;
                self.enqueue(ChannelPacket::Fragment {
                    sequence: self.send_sequence,
                    index: index as u32,
                    count,
                    bytes: chunk.to_vec(),
                });
            }
        }
        self.timer_running = true;
        Ok(())
    }

    fn enqueue(&mut self, packet: ChannelPacket<M>) {
        trace!("Queueing reliable packet {:?}", packet.sequence());
        self.outbox.push_back(packet.clone());
        self.send_list.push_back(packet);
    }

    /// Sends `message` once, outside the reliable stream.
    pub fn send_unreliable(&mut self, message: M) {
        self.outbox.push_back(ChannelPacket::Unreliable(message));
    }

    /// Advances the retransmit timer by one interval.
    ///
    /// Retransmits the next outstanding packet, or sends a keepalive when
    /// nothing is outstanding and keepalive is enabled. With keepalive
    /// enabled, the countdown is decremented and [`ChannelEvent::TimedOut`]
    /// is raised once it is exhausted.
    pub fn on_tick(&mut self) {
        if !self.timer_running {
            return;
        }

        let keep_alive = self.config.keep_alive_ticks();

        if self.send_list.is_empty() {
            if keep_alive.is_none() {
                self.timer_running = false;
                return;
            }
            if self.skip_next_keep_alive {
                self.skip_next_keep_alive = false;
            } else {
                self.outbox.push_back(ChannelPacket::KeepAlive);
            }
        } else {
            if self.cursor >= self.send_list.len() {
                self.cursor = 0;
            }
            if let Some(packet) = self.send_list.get(self.cursor) {
                trace!("Retransmitting {:?}", packet.sequence());
                self.outbox.push_back(packet.clone());
            }
            self.cursor += 1;
        }

        if keep_alive.is_some() {
            if self.countdown > 0 {
                self.countdown -= 1;
            } else {
                debug!("Keepalive expired (recv_sequence={})", self.recv_sequence);
                self.events.push_back(ChannelEvent::TimedOut);
                self.timer_running = false;
            }
        }
    }

    /// Processes one packet from the transport.
    pub fn recv(&mut self, packet: ChannelPacket<M>) {
        if let Some(ticks) = self.config.keep_alive_ticks() {
            self.countdown = ticks;
            self.timer_running = true;
        }

        match packet {
            ChannelPacket::KeepAlive => {},
            ChannelPacket::Unreliable(message) => {
                self.events.push_back(ChannelEvent::Unreliable(message));
            },
            ChannelPacket::Ack { sequence } => {
                self.ack_sequence = self.ack_sequence.max(sequence);
                while self
                    .send_list
                    .front()
                    .and_then(ChannelPacket::sequence)
                    .is_some_and(|front| front <= self.ack_sequence)
                {
                    self.send_list.pop_front();
                }
                self.cursor = 0;
                trace!(
                    "Ack {} (pending={})",
                    self.ack_sequence,
                    self.send_list.len()
                );
                debug_check_invariants!(self, "after ack");
            },
            ChannelPacket::Data { sequence, message } => {
                if self.accept(sequence) {
                    self.events.push_back(ChannelEvent::Delivered(message));
                }
            },
            ChannelPacket::Fragment {
                sequence,
                index,
                count,
                bytes,
            } => {
                if self.accept(sequence) {
                    self.reassemble(index, count, &bytes);
                }
            },
        }
    }

    /// Queues an ACK and returns `true` if `sequence` is the next one expected.
    fn accept(&mut self, sequence: u32) -> bool {
        if sequence != self.recv_sequence.wrapping_add(1) {
            trace!(
                "Out of order {} (expected {}); re-acking",
                sequence,
                self.recv_sequence.wrapping_add(1)
            );
            self.outbox.push_back(ChannelPacket::Ack {
                sequence: self.recv_sequence,
            });
            return false;
        }
        self.recv_sequence += 1;
        self.outbox.push_back(ChannelPacket::Ack {
            sequence: self.recv_sequence,
        });
        true
    }

    fn reassemble(&mut self, index: u32, count: u32, bytes: &[u8]) {
        if index == 0 {
            self.reassembly.clear();
        }
        self.reassembly.extend_from_slice(bytes);
        if index + 1 < count {
            return;
        }

        match codec::decode_exact::<M>(&self.reassembly) {
            Ok(message) => {
                debug!("Reassembled {} bytes from {} fragments", self.reassembly.len(), count);
                self.events.push_back(ChannelEvent::Delivered(message));
            },
            Err(err) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::ReliableChannel,
                    "dropping message reassembled from {} fragments ({} bytes): {}",
                    count,
                    self.reassembly.len(),
                    err
                );
            },
        }
        self.reassembly.clear();
    }

    /// Skips exactly one upcoming keepalive emission.
    pub fn delay_keep_alive_once(&mut self) {
        self.skip_next_keep_alive = true;
    }

    /// Forgets all sequences and outstanding packets and stops the timer.
    pub fn reset(&mut self) {
        self.send_sequence = 0;
        self.recv_sequence = 0;
        self.ack_sequence = 0;
        self.send_list.clear();
        self.cursor = 0;
        self.timer_running = false;
        self.reassembly.clear();
        self.countdown = self.config.keep_alive_ticks().unwrap_or(0);
    }

    /// Changes the tick period and recomputes the keepalive countdown.
    pub fn set_send_interval(&mut self, interval: Duration) {
        self.config.send_interval = interval;
        self.countdown = self.config.keep_alive_ticks().unwrap_or(0);
    }

    /// Changes (or disables) the keepalive and recomputes the countdown.
    pub fn set_keep_alive(&mut self, keep_alive: Option<Duration>) {
        self.config.keep_alive = keep_alive;
        self.countdown = self.config.keep_alive_ticks().unwrap_or(0);
    }

    /// Hands every queued packet to `transport`, in queue order.
    pub fn send_all_packets<T>(&mut self, transport: &mut T)
    where
        T: Transport<M> + ?Sized,
    {
        if self.outbox.is_empty() {
            return;
        }
        trace!("Sending {} packets", self.outbox.len());
        for packet in self.outbox.drain(..) {
            transport.send_raw(&packet);
        }
    }

    /// Drains owner-facing events in the order they happened.
    pub fn events(&mut self) -> Drain<'_, ChannelEvent<M>> {
        self.events.drain(..)
    }
}

impl<M> ReliableChannel<M> {
    /// Sequence of the last reliable packet queued.
    #[must_use]
    pub fn send_sequence(&self) -> u32 {
        self.send_sequence
    }

    /// Sequence of the last reliable packet accepted in order.
    #[must_use]
    pub fn recv_sequence(&self) -> u32 {
        self.recv_sequence
    }

    /// Highest sequence acknowledged by the peer.
    #[must_use]
    pub fn ack_sequence(&self) -> u32 {
        self.ack_sequence
    }

    /// Number of reliable packets awaiting acknowledgement.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.send_list.len()
    }

    /// Number of packets waiting for [`send_all_packets`](Self::send_all_packets).
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Returns `true` while retransmits or keepalives are scheduled.
    #[must_use]
    pub fn is_timer_running(&self) -> bool {
        self.timer_running
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl<M> InvariantChecker for ReliableChannel<M> {
    /// 1. Outstanding sequences are strictly increasing and above `ack_sequence`.
    /// 2. The newest outstanding sequence is `send_sequence`.
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut previous = self.ack_sequence;
        for sequence in self.send_list.iter().filter_map(ChannelPacket::sequence) {
            if sequence <= previous {
                return Err(InvariantViolation::new(
                    "ReliableChannel",
                    "outstanding sequences not strictly increasing above ack",
                )
                .with_details(format!(
                    "sequence={}, previous={}, ack={}",
                    sequence, previous, self.ack_sequence
                )));
            }
            previous = sequence;
        }

        if let Some(last) = self.send_list.back().and_then(ChannelPacket::sequence) {
            if last != self.send_sequence {
                return Err(InvariantViolation::new(
                    "ReliableChannel",
                    "newest outstanding packet is not send_sequence",
                )
                .with_details(format!("last={}, send_sequence={}", last, self.send_sequence)));
            }
        }

        Ok(())
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

    #[derive(Default)]
    struct Wire(Vec<ChannelPacket<u32>>);

    impl Transport<u32> for Wire {
        fn send_raw(&mut self, packet: &ChannelPacket<u32>) {
            self.0.push(packet.clone());
        }
    }

    fn channel() -> ReliableChannel<u32> {
        ReliableChannel::new(ChannelConfig::default())
    }

    fn keep_alive_channel(ticks: u64) -> ReliableChannel<u32> {
        ReliableChannel::new(ChannelConfig {
            send_interval: Duration::from_millis(10),
            keep_alive: Some(Duration::from_millis(10 * ticks)),
            ..ChannelConfig::default()
        })
    }

    fn flush<M: Clone + Serialize + DeserializeOwned>(
        channel: &mut ReliableChannel<M>,
    ) -> Vec<ChannelPacket<M>> {
        struct Collect<M>(Vec<ChannelPacket<M>>);
        impl<M: Clone> Transport<M> for Collect<M> {
            fn send_raw(&mut self, packet: &ChannelPacket<M>) {
                self.0.push(packet.clone());
            }
        }
        let mut collect = Collect(Vec::new());
        channel.send_all_packets(&mut collect);
        collect.0
    }

    fn delivered<M: Clone + Serialize + DeserializeOwned>(
        channel: &mut ReliableChannel<M>,
    ) -> Vec<M> {
        channel
            .events()
            .filter_map(|event| match event {
                ChannelEvent::Delivered(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn send_transmits_immediately_and_starts_timer() {
        let mut sender = channel();
        assert!(!sender.is_timer_running());
        sender.send(7).unwrap();
        assert!(sender.is_timer_running());
        assert_eq!(sender.send_sequence(), 1);

        let mut wire = Wire::default();
        sender.send_all_packets(&mut wire);
        assert_eq!(
            wire.0,
            vec![ChannelPacket::Data {
                sequence: 1,
                message: 7
            }]
        );
    }

    #[test]
    fn in_order_delivery_acks_each_packet() {
        let mut receiver = channel();
        receiver.recv(ChannelPacket::Data {
            sequence: 1,
            message: 10,
        });
        receiver.recv(ChannelPacket::Data {
            sequence: 2,
            message: 20,
        });
        assert_eq!(delivered(&mut receiver), vec![10, 20]);
        assert_eq!(
            flush(&mut receiver),
            vec![
                ChannelPacket::Ack { sequence: 1 },
                ChannelPacket::Ack { sequence: 2 }
            ]
        );
    }

    #[test]
    fn out_of_order_and_duplicates_are_reacked_not_delivered() {
        let mut receiver = channel();
        receiver.recv(ChannelPacket::Data {
            sequence: 2,
            message: 20,
        });
        receiver.recv(ChannelPacket::Data {
            sequence: 1,
            message: 10,
        });
        receiver.recv(ChannelPacket::Data {
            sequence: 1,
            message: 10,
        });
        assert_eq!(delivered(&mut receiver), vec![10]);
        assert_eq!(
            flush(&mut receiver),
            vec![
                ChannelPacket::Ack { sequence: 0 },
                ChannelPacket::Ack { sequence: 1 },
                ChannelPacket::Ack { sequence: 1 }
            ]
        );
        assert_eq!(receiver.recv_sequence(), 1);
    }

    #[test]
    fn ack_prunes_outstanding_packets() {
        let mut sender = channel();
        for message in 0..5 {
            sender.send(message).unwrap();
        }
        sender.recv(ChannelPacket::Ack { sequence: 3 });
        assert_eq!(sender.pending_len(), 2);
        assert_eq!(sender.ack_sequence(), 3);

        // A stale ack never moves the watermark back.
        sender.recv(ChannelPacket::Ack { sequence: 1 });
        assert_eq!(sender.ack_sequence(), 3);
        assert!(sender.check_invariants().is_ok());
    }

    #[test]
    fn ticks_retransmit_round_robin() {
        let mut sender = channel();
        sender.send(1).unwrap();
        sender.send(2).unwrap();
        let _ = flush(&mut sender);

        let sequences: Vec<_> = (0..4)
            .flat_map(|_| {
                sender.on_tick();
                flush(&mut sender)
            })
            .filter_map(|packet| packet.sequence())
            .collect();
        assert_eq!(sequences, vec![1, 2, 1, 2]);
    }

    #[test]
    fn ack_resets_cursor() {
        let mut sender = channel();
        for message in 0..3 {
            sender.send(message).unwrap();
        }
        sender.on_tick();
        sender.on_tick();
        let _ = flush(&mut sender);
        sender.recv(ChannelPacket::Ack { sequence: 1 });
        sender.on_tick();
        assert_eq!(flush(&mut sender)[0].sequence(), Some(2));
    }

    #[test]
    fn timer_stops_when_idle_without_keep_alive() {
        let mut sender = channel();
        sender.send(1).unwrap();
        sender.recv(ChannelPacket::Ack { sequence: 1 });
        sender.on_tick();
        assert!(!sender.is_timer_running());
        let _ = flush(&mut sender);
        sender.on_tick();
        assert!(flush(&mut sender).is_empty());
    }

    #[test]
    fn keep_alive_times_out_after_countdown() {
        let mut channel = keep_alive_channel(3);
        channel.recv(ChannelPacket::KeepAlive);
        assert!(channel.is_timer_running());

        for _ in 0..3 {
            channel.on_tick();
            assert!(channel.events().next().is_none());
        }
        channel.on_tick();
        assert_eq!(channel.events().collect::<Vec<_>>(), vec![ChannelEvent::TimedOut]);
        assert!(!channel.is_timer_running());

        let keep_alives = flush(&mut channel)
            .into_iter()
            .filter(|packet| *packet == ChannelPacket::KeepAlive)
            .count();
        assert_eq!(keep_alives, 4);
    }

    #[test]
    fn any_packet_refreshes_countdown() {
        let mut channel = keep_alive_channel(2);
        channel.recv(ChannelPacket::KeepAlive);
        for _ in 0..10 {
            channel.on_tick();
            channel.recv(ChannelPacket::KeepAlive);
        }
        assert!(channel.events().next().is_none());
    }

    #[test]
    fn delay_keep_alive_once_skips_exactly_one() {
        let mut channel = keep_alive_channel(100);
        channel.recv(ChannelPacket::KeepAlive);
        channel.delay_keep_alive_once();
        channel.on_tick();
        assert!(flush(&mut channel).is_empty());
        channel.on_tick();
        assert_eq!(flush(&mut channel), vec![ChannelPacket::KeepAlive]);
    }

    #[test]
    fn unreliable_messages_bypass_sequencing() {
        let mut sender = channel();
        sender.send_unreliable(99);
        assert_eq!(sender.pending_len(), 0);
        assert_eq!(flush(&mut sender), vec![ChannelPacket::Unreliable(99)]);

        let mut receiver = channel();
        receiver.recv(ChannelPacket::Unreliable(99));
        assert_eq!(
            receiver.events().collect::<Vec<_>>(),
            vec![ChannelEvent::Unreliable(99)]
        );
        assert_eq!(receiver.recv_sequence(), 0);
        assert_eq!(receiver.outbox_len(), 0);
    }

    #[test]
    fn large_messages_fragment_and_reassemble() {
        let config = ChannelConfig {
            mtu: 32,
            ..ChannelConfig::default()
        };
        let mut sender: ReliableChannel<Vec<u8>> = ReliableChannel::new(config);
        let mut receiver: ReliableChannel<Vec<u8>> = ReliableChannel::new(config);
        let payload: Vec<u8> = (0..100).collect();

        sender.send(payload.clone()).unwrap();
        let packets = flush(&mut sender);
        assert!(packets.len() > 1);
        assert_eq!(sender.send_sequence() as usize, packets.len());

        for packet in packets {
            receiver.recv(packet);
        }
        assert_eq!(delivered(&mut receiver), vec![payload]);
    }

    #[test]
    fn corrupt_fragments_are_dropped() {
        let mut receiver: ReliableChannel<Vec<u8>> = ReliableChannel::new(ChannelConfig::default());
        receiver.recv(ChannelPacket::Fragment {
            sequence: 1,
            index: 0,
            count: 2,
            bytes: vec![0xFF; 4],
        });
        receiver.recv(ChannelPacket::Fragment {
            sequence: 2,
            index: 1,
            count: 2,
            bytes: vec![0xFF; 4],
        });
        assert!(delivered(&mut receiver).is_empty());
        assert_eq!(receiver.recv_sequence(), 2);
    }

    #[test]
    fn reset_clears_state() {
        let mut sender = channel();
        sender.send(1).unwrap();
        sender.recv(ChannelPacket::Data {
            sequence: 1,
            message: 5,
        });
        sender.reset();
        assert_eq!(sender.send_sequence(), 0);
        assert_eq!(sender.recv_sequence(), 0);
        assert_eq!(sender.pending_len(), 0);
        assert!(!sender.is_timer_running());
    }

    #[test]
    fn interval_change_recomputes_countdown() {
        let mut channel = keep_alive_channel(4);
        channel.set_send_interval(Duration::from_millis(20));
        channel.recv(ChannelPacket::KeepAlive);
        channel.on_tick();
        channel.on_tick();
        assert!(channel.events().next().is_none());
        channel.on_tick();
        assert_eq!(channel.events().next(), Some(ChannelEvent::TimedOut));

        channel.set_keep_alive(None);
        channel.recv(ChannelPacket::KeepAlive);
        assert!(!channel.is_timer_running());
    }
}
