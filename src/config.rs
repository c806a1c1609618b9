use std::time::Duration;
use anyhow::bail;
use crate::packet_header::{FRAGMENT_HEADER_BYTES, MAX_PACKET_HEADER_BYTES};
use crate::sequence_buffer::SequenceBuffer;

/// Configuration of a single [crate::packet_controller::PacketController]. Both peers must agree
///  on fragment size and maximum fragment count, since the receiver validates fragments against
///  its own configuration.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    /// appears in log output to tell several controllers apart
    pub name: String,

    /// This is the upper bound for a single packet's payload. Bigger payloads are rejected on send
    ///  rather than truncated, and the receiver drops datagrams that could not have been produced
    ///  within this limit.
    pub max_packet_size: usize,

    /// Payloads bigger than this are split into fragments of `fragment_size` bytes. This should be
    ///  chosen so that a single fragment (plus headers) fits into a UDP datagram without IP level
    ///  fragmentation.
    pub fragment_threshold: usize,
    pub max_fragments: usize,
    pub fragment_size: usize,

    pub sent_packet_buffer_size: usize,
    pub received_packet_buffer_size: usize,
    pub fragment_reassembly_buffer_size: usize,

    pub rtt_smoothing_factor: f32,
    pub packet_loss_smoothing_factor: f32,
    pub bandwidth_smoothing_factor: f32,

    /// assumed per-packet overhead of IP and UDP headers, added to every packet's size for
    ///  bandwidth statistics
    pub packet_header_size: usize,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ReliableConfig {
    pub const MAX_FRAGMENTS_LIMIT: usize = 256;

    pub fn default_config() -> ReliableConfig {
        ReliableConfig {
            name: "endpoint".to_string(),
            max_packet_size: 16 * 1024,
            fragment_threshold: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            sent_packet_buffer_size: 256,
            received_packet_buffer_size: 256,
            fragment_reassembly_buffer_size: 64,
            rtt_smoothing_factor: 0.25,
            packet_loss_smoothing_factor: 0.1,
            bandwidth_smoothing_factor: 0.1,
            packet_header_size: 28,
        }
    }

    /// the biggest datagram a peer with this configuration can produce
    pub fn max_datagram_size(&self) -> usize {
        self.max_packet_size + MAX_PACKET_HEADER_BYTES + FRAGMENT_HEADER_BYTES
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size == 0 {
            bail!("max packet size must be positive");
        }
        if self.fragment_size == 0 {
            bail!("fragment size must be positive");
        }
        if self.max_fragments == 0 || self.max_fragments > Self::MAX_FRAGMENTS_LIMIT {
            bail!("max fragments must be in 1..={}, is {}", Self::MAX_FRAGMENTS_LIMIT, self.max_fragments);
        }
        if self.fragment_threshold > self.max_packet_size {
            bail!("fragment threshold {} exceeds max packet size {}", self.fragment_threshold, self.max_packet_size);
        }
        if self.max_packet_size > self.max_fragments * self.fragment_size {
            bail!("max packet size {} can not be sent in {} fragments of {} bytes", self.max_packet_size, self.max_fragments, self.fragment_size);
        }

        for (name, size) in [
            ("sent packet buffer", self.sent_packet_buffer_size),
            ("received packet buffer", self.received_packet_buffer_size),
            ("fragment reassembly buffer", self.fragment_reassembly_buffer_size),
        ] {
            validate_buffer_size(name, size)?;
        }

        for (name, factor) in [
            ("RTT", self.rtt_smoothing_factor),
            ("packet loss", self.packet_loss_smoothing_factor),
            ("bandwidth", self.bandwidth_smoothing_factor),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                bail!("{} smoothing factor must be in (0, 1], is {}", name, factor);
            }
        }

        Ok(())
    }
}

fn validate_buffer_size(name: &str, size: usize) -> anyhow::Result<()> {
    if size == 0 || size > SequenceBuffer::<()>::MAX_CAPACITY {
        bail!("{} size must be in 1..={}, is {}", name, SequenceBuffer::<()>::MAX_CAPACITY, size);
    }
    Ok(())
}

/// Configuration of a [crate::reliable_channel::ReliableMessageChannel]
#[derive(Clone, Debug)]
pub struct ReliableChannelConfig {
    pub packet: ReliableConfig,

    /// This is the maximum number of unacknowledged *messages* in flight. Messages sent beyond that
    ///  are queued without limit until older messages are acknowledged.
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    /// number of sent *packets* for which the contained message ids are remembered
    pub ack_buffer_size: usize,

    /// minimum delay before a message is sent again if it was not acknowledged
    pub resend_interval: Duration,
    /// if no message was sent for this long, an ack-only packet is sent to keep the peer's ack
    ///  information current
    pub keepalive_interval: Duration,

    pub flush_interval: Duration,
    pub congested_flush_interval: Duration,

    /// RTT at or above this threshold switches to congestion mode
    pub congestion_rtt_threshold: Duration,
    /// re-entering congestion mode within this window after the previous mode switch doubles the
    ///  time it takes to leave congestion mode again
    pub congestion_switch_window: Duration,
    pub congestion_min_disable_interval: Duration,
    pub congestion_max_disable_interval: Duration,
    /// period of good conditions after which the disable interval is halved
    pub congestion_recovery_interval: Duration,
}

impl Default for ReliableChannelConfig {
    fn default() -> Self {
        ReliableChannelConfig {
            packet: ReliableConfig::default_config(),
            send_buffer_size: 256,
            receive_buffer_size: 256,
            ack_buffer_size: 256,
            resend_interval: Duration::from_millis(100),
            keepalive_interval: Duration::from_millis(100),
            flush_interval: Duration::from_millis(33),
            congested_flush_interval: Duration::from_millis(100),
            congestion_rtt_threshold: Duration::from_millis(250),
            congestion_switch_window: Duration::from_secs(10),
            congestion_min_disable_interval: Duration::from_secs(5),
            congestion_max_disable_interval: Duration::from_secs(60),
            congestion_recovery_interval: Duration::from_secs(10),
        }
    }
}

impl ReliableChannelConfig {
    /// the biggest framed message that still fits into a single (possibly fragmented) packet
    pub fn max_framed_message_len(&self) -> usize {
        self.packet.max_packet_size
            .saturating_sub(FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.packet.validate()?;

        for (name, size) in [
            ("send buffer", self.send_buffer_size),
            ("receive buffer", self.receive_buffer_size),
            ("ack buffer", self.ack_buffer_size),
        ] {
            validate_buffer_size(name, size)?;
        }

        // messages in flight beyond the receiver's window would be acked without being buffered
        if self.send_buffer_size > self.receive_buffer_size {
            bail!("send buffer size {} exceeds receive buffer size {}", self.send_buffer_size, self.receive_buffer_size);
        }
        if self.packet.fragment_threshold <= MAX_PACKET_HEADER_BYTES {
            bail!("fragment threshold must leave room for a packet header");
        }
        if self.max_framed_message_len() == 0 {
            bail!("max packet size must leave room for packet and fragment headers");
        }
        if self.congestion_min_disable_interval > self.congestion_max_disable_interval {
            bail!("congestion disable interval: min {:?} exceeds max {:?}", self.congestion_min_disable_interval, self.congestion_max_disable_interval);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        ReliableConfig::default_config().validate().unwrap();
        ReliableChannelConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_packet_size(|c: &mut ReliableConfig| c.max_packet_size = 0)]
    #[case::zero_fragment_size(|c: &mut ReliableConfig| c.fragment_size = 0)]
    #[case::too_many_fragments(|c: &mut ReliableConfig| c.max_fragments = 257)]
    #[case::packet_too_big_for_fragments(|c: &mut ReliableConfig| c.max_packet_size = 16 * 1024 + 1)]
    #[case::threshold_above_packet_size(|c: &mut ReliableConfig| { c.max_packet_size = 512; c.fragment_threshold = 513; })]
    #[case::empty_sent_buffer(|c: &mut ReliableConfig| c.sent_packet_buffer_size = 0)]
    #[case::huge_received_buffer(|c: &mut ReliableConfig| c.received_packet_buffer_size = 32769)]
    #[case::zero_smoothing(|c: &mut ReliableConfig| c.rtt_smoothing_factor = 0.0)]
    #[case::big_smoothing(|c: &mut ReliableConfig| c.bandwidth_smoothing_factor = 1.5)]
    #[case::nan_smoothing(|c: &mut ReliableConfig| c.packet_loss_smoothing_factor = f32::NAN)]
    fn test_invalid_reliable_config(#[case] modify: fn(&mut ReliableConfig)) {
        let mut config = ReliableConfig::default_config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::empty_send_buffer(|c: &mut ReliableChannelConfig| c.send_buffer_size = 0)]
    #[case::tiny_threshold(|c: &mut ReliableChannelConfig| c.packet.fragment_threshold = 10)]
    #[case::min_above_max(|c: &mut ReliableChannelConfig| c.congestion_min_disable_interval = Duration::from_secs(61))]
    #[case::invalid_packet_config(|c: &mut ReliableChannelConfig| c.packet.max_fragments = 0)]
    #[case::send_window_exceeds_receive_window(|c: &mut ReliableChannelConfig| c.send_buffer_size = c.receive_buffer_size + 1)]
    fn test_invalid_channel_config(#[case] modify: fn(&mut ReliableChannelConfig)) {
        let mut config = ReliableChannelConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
