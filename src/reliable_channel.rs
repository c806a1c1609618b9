//! Reliable, ordered delivery of messages on top of [PacketController].
//!
//! Messages are numbered with a 16-bit message id of their own, independent of packet sequence
//!  numbers. Every flush packs all messages that are unacknowledged and not sent recently into as
//!  few packets as possible, remembering which message ids went into which packet:
//!
//! ```ascii
//! send_message ─► overflow queue ─► send buffer ─► packer ─► PacketController::send_packet
//!                 (if too many in flight)              │
//!                                                      └─► ack buffer: packet seq -> message ids
//! ```
//!
//! When the peer acks a packet, all messages it contained are removed from the send buffer.
//!  Unacknowledged messages are resent on every flush once the resend interval has passed, so
//!  delivery does not depend on any specific packet making it.
//!
//! The receiving side buffers messages by id and delivers them strictly in id order, each exactly
//!  once.

use std::collections::VecDeque;
use std::time::Duration;
use anyhow::bail;
use bytes::BytesMut;
use tracing::{debug, trace};
use crate::config::ReliableChannelConfig;
use crate::congestion::CongestionMonitor;
use crate::message_channel::{ChannelSink, MessageChannel, QosType, SinkTransmitter};
use crate::message_header::{parse_messages, MessageHeader};
use crate::packet_controller::{NetworkStats, PacketController, PacketReceiver};
use crate::packet_header::{FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES};
use crate::safe_converter::SafeCast;
use crate::sequence::sequence_less_than;
use crate::sequence_buffer::SequenceBuffer;

#[derive(Default)]
struct BufferedMessage {
    last_sent: Option<Duration>,
    /// message header followed by the message bytes, ready to be appended to a packet
    framed: Vec<u8>,
}

#[derive(Default)]
struct OutgoingPacket {
    message_ids: Vec<u16>,
}

/// The part of the channel's state that the packet controller's callbacks work on
struct ChannelState {
    name: String,

    send_buffer: SequenceBuffer<BufferedMessage>,
    receive_buffer: SequenceBuffer<Vec<u8>>,
    ack_buffer: SequenceBuffer<OutgoingPacket>,

    /// the id for the next message that is sent
    sequence: u16,
    oldest_unacked: u16,
    next_receive: u16,
}

impl ChannelState {
    fn new(config: &ReliableChannelConfig) -> ChannelState {
        ChannelState {
            name: config.packet.name.clone(),
            send_buffer: SequenceBuffer::new(config.send_buffer_size),
            receive_buffer: SequenceBuffer::new(config.receive_buffer_size),
            ack_buffer: SequenceBuffer::new(config.ack_buffer_size),
            sequence: 0,
            oldest_unacked: 0,
            next_receive: 0,
        }
    }

    fn reset(&mut self) {
        self.send_buffer.reset();
        self.receive_buffer.reset();
        self.ack_buffer.reset();
        self.sequence = 0;
        self.oldest_unacked = 0;
        self.next_receive = 0;
    }

    fn num_in_flight(&self) -> usize {
        self.sequence.wrapping_sub(self.oldest_unacked).safe_cast()
    }

    fn has_send_capacity(&self) -> bool {
        self.num_in_flight() < self.send_buffer.capacity()
    }

    /// callers must check [ChannelState::has_send_capacity] and the message's size first
    fn buffer_message(&mut self, message: &[u8]) -> anyhow::Result<()> {
        let message_id = self.sequence;
        let header = MessageHeader::for_message(message_id, message)?;

        let Some(buffered) = self.send_buffer.insert(message_id) else {
            bail!("message id #{} is outside the send buffer's window", message_id);
        };
        buffered.framed.reserve(header.serialized_len() + message.len());
        header.ser(&mut buffered.framed);
        buffered.framed.extend_from_slice(message);

        self.sequence = self.sequence.wrapping_add(1);
        trace!("{}: buffered message #{} with {} bytes", self.name, message_id, message.len());
        Ok(())
    }

    fn ack_packet(&mut self, packet_sequence: u16) {
        let Some(outgoing) = self.ack_buffer.find_mut(packet_sequence) else {
            return;
        };
        let message_ids = std::mem::take(&mut outgoing.message_ids);
        self.ack_buffer.remove(packet_sequence);

        for message_id in message_ids {
            if self.send_buffer.exists(message_id) {
                trace!("{}: message #{} acked with packet #{}", self.name, message_id, packet_sequence);
                self.send_buffer.remove(message_id);
            }
        }

        while sequence_less_than(self.oldest_unacked, self.sequence) && !self.send_buffer.exists(self.oldest_unacked) {
            self.oldest_unacked = self.oldest_unacked.wrapping_add(1);
        }
    }

    fn process_packet(&mut self, payload: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let messages = parse_messages(payload)?;

        let window_end = self.next_receive.wrapping_add(self.receive_buffer.capacity() as u16);
        for (message_id, message) in messages {
            if sequence_less_than(message_id, self.next_receive) || self.receive_buffer.exists(message_id) {
                trace!("{}: skipping duplicate message #{}", self.name, message_id);
            }
            else if !sequence_less_than(message_id, window_end) {
                debug!("{}: dropping message #{} beyond the receive window", self.name, message_id);
            }
            else if let Some(buffered) = self.receive_buffer.insert(message_id) {
                buffered.extend_from_slice(message);
            }

            while let Some(message) = self.receive_buffer.find(self.next_receive) {
                trace!("{}: delivering message #{} with {} bytes", self.name, self.next_receive, message.len());
                sink.deliver(message);
                self.receive_buffer.remove(self.next_receive);
                self.next_receive = self.next_receive.wrapping_add(1);
            }
        }
        Ok(())
    }
}

struct StateReceiver<'a> {
    state: &'a mut ChannelState,
    sink: &'a mut dyn ChannelSink,
}

impl PacketReceiver for StateReceiver<'_> {
    fn process_packet(&mut self, _sequence: u16, payload: &[u8]) -> anyhow::Result<()> {
        self.state.process_packet(payload, self.sink)
    }

    fn ack_packet(&mut self, sequence: u16) {
        self.state.ack_packet(sequence);
    }
}

/// Guarantees exactly-once, in-order delivery as long as the connection eventually gets *some*
///  packets through in both directions.
///
/// The send rate adapts to RTT (see [CongestionMonitor]): packets are flushed at a reduced rate
///  while the connection looks congested.
pub struct ReliableMessageChannel {
    config: ReliableChannelConfig,
    controller: PacketController,
    state: ChannelState,
    congestion: CongestionMonitor,

    /// messages waiting for room in the send buffer, in send order
    overflow: VecDeque<Vec<u8>>,

    packer: BytesMut,
    packed_message_ids: Vec<u16>,

    time: Duration,
    last_flush: Option<Duration>,
    last_message_send: Option<Duration>,
}

impl ReliableMessageChannel {
    pub fn new(config: ReliableChannelConfig, time: Duration) -> anyhow::Result<ReliableMessageChannel> {
        config.validate()?;

        Ok(ReliableMessageChannel {
            controller: PacketController::new(config.packet.clone(), time)?,
            state: ChannelState::new(&config),
            congestion: CongestionMonitor::new(&config),
            overflow: VecDeque::new(),
            packer: BytesMut::with_capacity(config.packet.max_packet_size),
            packed_message_ids: Vec::new(),
            time,
            last_flush: None,
            last_message_send: None,
            config,
        })
    }

    pub fn controller(&self) -> &PacketController {
        &self.controller
    }

    pub fn stats(&self) -> NetworkStats {
        self.controller.stats()
    }

    pub fn is_congested(&self) -> bool {
        self.congestion.is_congested()
    }

    /// number of messages that were sent but not acknowledged yet, including queued messages
    pub fn num_pending(&self) -> usize {
        (self.state.sequence.wrapping_sub(self.state.oldest_unacked) as usize) + self.overflow.len()
    }

    fn process_send_buffer(&mut self, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let fragment_threshold = self.config.packet.fragment_threshold;
        let max_packet_size = self.config.packet.max_packet_size;

        let mut message_id = self.state.oldest_unacked;
        for _ in 0..self.state.send_buffer.capacity() {
            if !sequence_less_than(message_id, self.state.sequence) {
                break;
            }
            let current = message_id;
            message_id = message_id.wrapping_add(1);

            let Some(message) = self.state.send_buffer.find(current) else {
                continue;
            };
            if let Some(last_sent) = message.last_sent {
                if self.time.saturating_sub(last_sent) < self.config.resend_interval {
                    continue;
                }
            }

            let framed_len = message.framed.len();
            let limit = if framed_len < fragment_threshold {
                fragment_threshold - MAX_PACKET_HEADER_BYTES
            }
            else {
                max_packet_size - FRAGMENT_HEADER_BYTES - MAX_PACKET_HEADER_BYTES
            };
            if self.packer.len() + framed_len > limit {
                self.flush_packer(sink)?;
            }

            if let Some(message) = self.state.send_buffer.find_mut(current) {
                self.packer.extend_from_slice(&message.framed);
                message.last_sent = Some(self.time);
                self.packed_message_ids.push(current);
                self.last_message_send = Some(self.time);
            }
        }

        let is_idle = match self.last_message_send {
            None => true,
            Some(last) => self.time.saturating_sub(last) >= self.config.keepalive_interval,
        };
        if is_idle {
            let channel_id = self.channel_id();
            self.controller.send_ack(channel_id, &mut SinkTransmitter(sink))?;
            self.last_message_send = Some(self.time);
        }

        self.flush_packer(sink)
    }

    fn flush_packer(&mut self, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        if self.packer.is_empty() {
            return Ok(());
        }

        let channel_id = self.channel_id();
        let packet_sequence = self.controller.send_packet(&self.packer, channel_id, &mut SinkTransmitter(sink))?;
        trace!("{}: sent packet #{} with messages {:?}", self.state.name, packet_sequence, self.packed_message_ids);

        if let Some(outgoing) = self.state.ack_buffer.insert(packet_sequence) {
            outgoing.message_ids.append(&mut self.packed_message_ids);
        }
        self.packed_message_ids.clear();
        self.packer.clear();
        Ok(())
    }
}

impl MessageChannel for ReliableMessageChannel {
    fn channel_id(&self) -> u8 {
        QosType::Reliable.channel_id()
    }

    fn reset(&mut self) {
        self.controller.reset();
        self.state.reset();
        self.congestion.reset();
        self.overflow.clear();
        self.packer.clear();
        self.packed_message_ids.clear();
        self.last_flush = None;
        self.last_message_send = None;
    }

    fn update(&mut self, time: Duration, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let elapsed = time.saturating_sub(self.time);
        self.time = time;
        self.controller.update(time);

        if self.state.has_send_capacity() {
            if let Some(message) = self.overflow.pop_front() {
                self.state.buffer_message(&message)?;
            }
        }

        self.congestion.on_update(time, elapsed, self.controller.rtt());
        let flush_interval = if self.congestion.is_congested() {
            self.config.congested_flush_interval
        }
        else {
            self.config.flush_interval
        };

        let flush_due = match self.last_flush {
            None => true,
            Some(last) => time.saturating_sub(last) >= flush_interval,
        };
        if flush_due {
            self.last_flush = Some(time);
            self.process_send_buffer(sink)?;
        }
        Ok(())
    }

    fn receive_packet(&mut self, datagram: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let mut receiver = StateReceiver {
            state: &mut self.state,
            sink,
        };
        self.controller.receive_packet(datagram, &mut receiver)
    }

    /// Messages are only buffered here, they go on the wire with the next flush during
    ///  [MessageChannel::update].
    fn send_message(&mut self, message: &[u8], _sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let header = MessageHeader::for_message(self.state.sequence, message)?;
        let framed_len = header.serialized_len() + message.len();
        if framed_len > self.config.max_framed_message_len() {
            bail!("message of {} bytes does not fit into a single packet, max is {} bytes including framing", message.len(), self.config.max_framed_message_len());
        }

        if !self.overflow.is_empty() || !self.state.has_send_capacity() {
            trace!("{}: send buffer is full, queueing message with {} bytes", self.state.name, message.len());
            self.overflow.push_back(message.to_vec());
            return Ok(());
        }

        self.state.buffer_message(message)
    }
}
