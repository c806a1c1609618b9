use std::time::Duration;
use num_enum::TryFromPrimitive;
use tracing::warn;
use crate::config::ReliableChannelConfig;
use crate::message_channel::{ChannelSink, MessageChannel, QosType};
use crate::packet_controller::NetworkStats;
use crate::packet_header::channel_id_of;
use crate::reliable_channel::ReliableMessageChannel;
use crate::unreliable_channel::{UnreliableMessageChannel, UnreliableOrderedMessageChannel};

/// One side of a connection, routing messages through a channel per [QosType].
///
/// The endpoint does no I/O and never looks at a clock: the application passes in received
///  datagrams and the current time, and gets outgoing datagrams and received messages through a
///  [ChannelSink]. A server talking to many peers keeps one endpoint per peer, telling them apart
///  by [ReliableEndpoint::index].
pub struct ReliableEndpoint {
    index: u32,
    time: Duration,
    reliable: ReliableMessageChannel,
    unreliable: UnreliableMessageChannel,
    unreliable_ordered: UnreliableOrderedMessageChannel,
}

impl ReliableEndpoint {
    /// The unreliable channels use the packet level part of the configuration.
    pub fn new(config: ReliableChannelConfig, time: Duration) -> anyhow::Result<ReliableEndpoint> {
        Ok(ReliableEndpoint {
            index: 0,
            time,
            unreliable: UnreliableMessageChannel::new(config.packet.clone(), time)?,
            unreliable_ordered: UnreliableOrderedMessageChannel::new(config.packet.clone(), time)?,
            reliable: ReliableMessageChannel::new(config, time)?,
        })
    }

    pub fn with_default_config(time: Duration) -> anyhow::Result<ReliableEndpoint> {
        Self::new(ReliableChannelConfig::default(), time)
    }

    /// tags the endpoint with an application defined index, e.g. a peer slot in a server
    pub fn with_index(mut self, index: u32) -> ReliableEndpoint {
        self.index = index;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    fn channel_mut(&mut self, qos: QosType) -> &mut dyn MessageChannel {
        match qos {
            QosType::Reliable => &mut self.reliable,
            QosType::Unreliable => &mut self.unreliable,
            QosType::UnreliableOrdered => &mut self.unreliable_ordered,
        }
    }

    pub fn reset(&mut self) {
        for qos in QosType::ALL {
            self.channel_mut(qos).reset();
        }
    }

    pub fn update(&mut self, time: Duration, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.time = time;
        for qos in QosType::ALL {
            self.channel_mut(qos).update(time, sink)?;
        }
        Ok(())
    }

    /// advances the endpoint's own notion of time, for callers without a clock of their own
    pub fn update_fast_forward(&mut self, increment: Duration, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.update(self.time + increment, sink)
    }

    pub fn send_message(&mut self, message: &[u8], qos: QosType, sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        self.channel_mut(qos).send_message(message, sink)
    }

    /// Routes a datagram to its channel. A datagram that is rejected leaves the endpoint's state
    ///  unchanged.
    pub fn receive_packet(&mut self, datagram: &[u8], sink: &mut dyn ChannelSink) -> anyhow::Result<()> {
        let result = match channel_id_of(datagram) {
            Ok(channel_id) => match QosType::try_from_primitive(channel_id) {
                Ok(qos) => self.channel_mut(qos).receive_packet(datagram, sink),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("rejecting datagram of {} bytes: {}", datagram.len(), e);
        }
        result
    }

    /// statistics of the reliable channel, which is the only one with acknowledged traffic
    pub fn stats(&self) -> NetworkStats {
        self.reliable.stats()
    }

    pub fn rtt(&self) -> f32 {
        self.reliable.controller().rtt()
    }

    pub fn packet_loss(&self) -> f32 {
        self.reliable.controller().packet_loss()
    }

    pub fn sent_bandwidth_kbps(&self) -> f32 {
        self.reliable.controller().sent_bandwidth_kbps()
    }

    pub fn received_bandwidth_kbps(&self) -> f32 {
        self.reliable.controller().received_bandwidth_kbps()
    }
}
