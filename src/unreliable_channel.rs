//! Best-effort channels. Neither of them retransmits anything: a message that is lost on the wire
//!  is gone, and applications using these channels must be able to live with that.
//!
//! Each message is sent as a packet of its own, so the packet sequence number identifies the
//!  message on the receiving side.

use std::time::Duration;
use tracing::{debug, trace};
use crate::config::ReliableConfig;
use crate::message_channel::{ChannelSink, MessageChannel, QosType, SinkTransmitter};
use crate::packet_controller::{PacketController, PacketReceiver};
use crate::sequence::sequence_greater_equal;
use crate::sequence_buffer::SequenceBuffer;

/// Delivers messages in whatever order they arrive, but never twice.
pub struct UnreliableMessageChannel {
    name: String,
    controller: PacketController,
    received: SequenceBuffer<()>,
}

impl UnreliableMessageChannel {
    pub const DEDUP_BUFFER_SIZE: usize = 256;

    pub fn new(config: ReliableConfig, time: Duration) -> anyhow::Result<UnreliableMessageChannel> {
        Ok(UnreliableMessageChannel {
            name: config.name.clone(),
            controller: PacketController::new(config, time)?,
            received: SequenceBuffer::new(Self::DEDUP_BUFFER_SIZE),
        })
    }

    pub fn controller(&self) -> &PacketController {
        &self.controller
    }
}

struct DedupReceiver<'a> {
    name: &'a str,
    received: &'a mut SequenceBuffer<()>,
    sink: &'a mut dyn ChannelSink,
}

impl PacketReceiver for DedupReceiver<'_> {
    fn process_packet(&mut self, sequence: u16, payload: &[u8]) -> anyhow::Result<()> {
        if self.received.exists(sequence) || self.received.insert(sequence).is_none() {
            debug!("{}: dropping duplicate message #{}", self.name, sequence);
            return Ok(());
        }

        trace!("{}: delivering message #{} with {} bytes", self.name, sequence, payload.len());
        self.sink.deliver(payload);
        Ok(())
    }

    fn ack_packet(&mut self, _sequence: u16) {}
}

impl MessageChannel for UnreliableMessageChannel {
    fn channel_id(&self) -> u8 {
        QosType::Unreliable.channel_id()
    }

    fn reset(&mut self) {
        self.controller.reset();
        self.received.reset();
    }

    fn update(&mut self, time: Duration, _sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.controller.update(time);
        Ok(())
    }

    fn receive_packet(&mut self, datagram: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let mut receiver = DedupReceiver {
            name: &self.name,
            received: &mut self.received,
            sink,
        };
        self.controller.receive_packet(datagram, &mut receiver)
    }

    fn send_message(&mut self, message: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.controller.send_packet(message, self.channel_id(), &mut SinkTransmitter(sink))?;
        Ok(())
    }
}

/// Delivers a message only if it is newer than every message delivered before. Late arrivals are
///  dropped rather than buffered, trading completeness for recency.
pub struct UnreliableOrderedMessageChannel {
    name: String,
    controller: PacketController,
    next_sequence: u16,
}

impl UnreliableOrderedMessageChannel {
    pub fn new(config: ReliableConfig, time: Duration) -> anyhow::Result<UnreliableOrderedMessageChannel> {
        Ok(UnreliableOrderedMessageChannel {
            name: config.name.clone(),
            controller: PacketController::new(config, time)?,
            next_sequence: 0,
        })
    }

    pub fn controller(&self) -> &PacketController {
        &self.controller
    }
}

struct OrderedReceiver<'a> {
    name: &'a str,
    next_sequence: &'a mut u16,
    sink: &'a mut dyn ChannelSink,
}

impl PacketReceiver for OrderedReceiver<'_> {
    fn process_packet(&mut self, sequence: u16, payload: &[u8]) -> anyhow::Result<()> {
        if !sequence_greater_equal(sequence, *self.next_sequence) {
            debug!("{}: dropping late message #{}, expecting #{} or newer", self.name, sequence, self.next_sequence);
            return Ok(());
        }

        *self.next_sequence = sequence.wrapping_add(1);
        trace!("{}: delivering message #{} with {} bytes", self.name, sequence, payload.len());
        self.sink.deliver(payload);
        Ok(())
    }

    fn ack_packet(&mut self, _sequence: u16) {}
}

impl MessageChannel for UnreliableOrderedMessageChannel {
    fn channel_id(&self) -> u8 {
        QosType::UnreliableOrdered.channel_id()
    }

    fn reset(&mut self) {
        self.controller.reset();
        self.next_sequence = 0;
    }

    fn update(&mut self, time: Duration, _sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.controller.update(time);
        Ok(())
    }

    fn receive_packet(&mut self, datagram: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let mut receiver = OrderedReceiver {
            name: &self.name,
            next_sequence: &mut self.next_sequence,
            sink,
        };
        self.controller.receive_packet(datagram, &mut receiver)
    }

    fn send_message(&mut self, message: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.controller.send_packet(message, self.channel_id(), &mut SinkTransmitter(sink))?;
        Ok(())
    }
}
