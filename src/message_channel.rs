use std::time::Duration;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::packet_controller::PacketTransmitter;

/// The quality of service a message is sent with. The numeric value doubles as the channel id on
///  the wire.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum QosType {
    /// exactly-once, in-order delivery with retransmission
    Reliable = 0,
    /// Best effort: messages may be lost or arrive out of order, but are never delivered twice.
    Unreliable = 1,
    /// Best effort, but messages older than the newest delivered message are dropped
    UnreliableOrdered = 2,
}

impl QosType {
    pub const ALL: [QosType; 3] = [QosType::Reliable, QosType::Unreliable, QosType::UnreliableOrdered];

    pub fn channel_id(self) -> u8 {
        self.into()
    }
}

/// Connects a channel to its surroundings: outgoing datagrams go to `transmit`, received
///  application messages to `deliver`.
///
/// Both are called synchronously from inside the channel and must not call back into it.
#[cfg_attr(test, automock)]
pub trait ChannelSink {
    fn transmit(&mut self, datagram: &[u8]);

    fn deliver(&mut self, message: &[u8]);
}

/// A channel owns its own packet controller and sequence space, so channels are fully
///  independent of each other.
pub trait MessageChannel {
    fn channel_id(&self) -> u8;

    fn reset(&mut self);

    fn update(&mut self, time: Duration, sink: &mut dyn ChannelSink) -> anyhow::Result<()>;

    fn receive_packet(&mut self, datagram: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()>;

    fn send_message(&mut self, message: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()>;
}

/// lets a packet controller transmit through a [ChannelSink]
pub(crate) struct SinkTransmitter<'a>(pub &'a mut dyn ChannelSink);

impl PacketTransmitter for SinkTransmitter<'_> {
    fn transmit_packet(&mut self, datagram: &[u8]) {
        self.0.transmit(datagram);
    }
}
