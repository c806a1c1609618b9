use std::time::Duration;
use anyhow::bail;
use bit_set::BitSet;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};
use crate::config::ReliableConfig;
use crate::packet_header::{is_fragment, read_fragment, FragmentHeader, PacketHeader, ParsedFragment, FRAGMENT_HEADER_BYTES, MAX_CHANNEL_ID, MAX_PACKET_HEADER_BYTES};
use crate::safe_converter::PrecheckedCast;
use crate::sequence_buffer::SequenceBuffer;

/// Receives raw datagrams that are ready to go on the wire.
#[cfg_attr(test, automock)]
pub trait PacketTransmitter {
    fn transmit_packet(&mut self, datagram: &[u8]);
}

/// The owner of a [PacketController] is notified through this trait about incoming packets and
///  about acknowledgement of its own packets.
///
/// Both callbacks are invoked synchronously from inside the controller, exactly once per event,
///  and have no way of calling back into the controller.
#[cfg_attr(test, automock)]
pub trait PacketReceiver {
    /// An error returned from here means the payload is malformed. The controller propagates it
    ///  and does not record the packet as received.
    fn process_packet(&mut self, sequence: u16, payload: &[u8]) -> anyhow::Result<()>;

    fn ack_packet(&mut self, sequence: u16);
}

/// Smoothed connection statistics. These are diagnostic values, except that RTT drives the
///  reliable channel's congestion mode.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetworkStats {
    pub rtt_millis: f32,
    /// fraction in `[0, 1]`
    pub packet_loss: f32,
    pub sent_bandwidth_kbps: f32,
    pub received_bandwidth_kbps: f32,
    pub acked_bandwidth_kbps: f32,
}

#[derive(Default)]
struct SentPacketData {
    time: Duration,
    packet_bytes: usize,
    acked: bool,
}

#[derive(Default)]
struct ReceivedPacketData {
    time: Duration,
    packet_bytes: usize,
}

/// Reassembly state for a single fragmented packet.
///
/// `packet_data` reserves `MAX_PACKET_HEADER_BYTES` in front of the payload area, so the
///  embedded packet header (which has variable length and arrives with fragment 0) can be
///  written directly in front of the payload:
///
/// ```ascii
/// | unused | packet header | fragment 0 | fragment 1 | ... | last fragment |
///          ^ header_offset ^ MAX_PACKET_HEADER_BYTES
/// ```
#[derive(Default)]
struct FragmentReassemblyData {
    num_fragments_total: usize,
    num_fragments_received: usize,
    fragment_received: BitSet,
    packet_data: Vec<u8>,
    header_offset: usize,
    payload_len: usize,
}

impl FragmentReassemblyData {
    fn init(&mut self, num_fragments: usize, fragment_size: usize) {
        self.num_fragments_total = num_fragments;
        self.num_fragments_received = 0;
        self.fragment_received = BitSet::with_capacity(num_fragments);
        self.packet_data.clear();
        self.packet_data.resize(MAX_PACKET_HEADER_BYTES + num_fragments * fragment_size, 0);
        self.header_offset = MAX_PACKET_HEADER_BYTES;
        self.payload_len = 0;
    }

    /// returns `false` for a duplicate fragment
    fn store(&mut self, fragment: &ParsedFragment, fragment_size: usize) -> bool {
        let fragment_id = fragment.header.fragment_id as usize;
        if !self.fragment_received.insert(fragment_id) {
            return false;
        }
        self.num_fragments_received += 1;

        if let Some(packet_header) = fragment.packet_header {
            self.header_offset = MAX_PACKET_HEADER_BYTES - packet_header.len();
            self.packet_data[self.header_offset..MAX_PACKET_HEADER_BYTES].copy_from_slice(packet_header);
        }

        let offset = MAX_PACKET_HEADER_BYTES + fragment_id * fragment_size;
        self.packet_data[offset..offset + fragment.payload.len()].copy_from_slice(fragment.payload);

        if fragment_id == self.num_fragments_total - 1 {
            self.payload_len = (self.num_fragments_total - 1) * fragment_size + fragment.payload.len();
        }
        true
    }

    fn is_complete(&self) -> bool {
        self.num_fragments_received == self.num_fragments_total
    }

    /// the reassembled regular packet: header followed by payload
    fn packet(&self) -> &[u8] {
        &self.packet_data[self.header_offset..MAX_PACKET_HEADER_BYTES + self.payload_len]
    }
}

/// Sends and receives packets on behalf of a single channel, adding a packet header with sequence
///  number and ack information. It splits big packets into fragments and reassembles them on the
///  receiving side, tracks which of its packets the peer acknowledged, and derives RTT, packet
///  loss and bandwidth statistics from that.
///
/// The controller does not retransmit anything: it reports acks to its [PacketReceiver], and it is
///  up to the owner to decide what to do about packets that are never acknowledged.
pub struct PacketController {
    config: ReliableConfig,
    time: Duration,
    sequence: u16,

    stats: NetworkStats,

    sent_packets: SequenceBuffer<SentPacketData>,
    received_packets: SequenceBuffer<ReceivedPacketData>,
    fragment_reassembly: SequenceBuffer<FragmentReassemblyData>,

    transmit_buf: BytesMut,
    reassembled_packet: Vec<u8>,
}

impl PacketController {
    const SMOOTHING_EPSILON: f32 = 0.00001;

    pub fn new(config: ReliableConfig, time: Duration) -> anyhow::Result<PacketController> {
        config.validate()?;

        Ok(PacketController {
            time,
            sequence: 0,
            stats: NetworkStats::default(),
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            received_packets: SequenceBuffer::new(config.received_packet_buffer_size),
            fragment_reassembly: SequenceBuffer::new(config.fragment_reassembly_buffer_size),
            transmit_buf: BytesMut::with_capacity(MAX_PACKET_HEADER_BYTES + config.fragment_threshold.max(config.fragment_size) + FRAGMENT_HEADER_BYTES),
            reassembled_packet: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    pub fn next_packet_sequence(&self) -> u16 {
        self.sequence
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn rtt(&self) -> f32 {
        self.stats.rtt_millis
    }

    pub fn packet_loss(&self) -> f32 {
        self.stats.packet_loss
    }

    pub fn sent_bandwidth_kbps(&self) -> f32 {
        self.stats.sent_bandwidth_kbps
    }

    pub fn received_bandwidth_kbps(&self) -> f32 {
        self.stats.received_bandwidth_kbps
    }

    pub fn acked_bandwidth_kbps(&self) -> f32 {
        self.stats.acked_bandwidth_kbps
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
        self.stats = NetworkStats::default();
        self.sent_packets.reset();
        self.received_packets.reset();
        self.fragment_reassembly.reset();
    }

    /// Sends a packet without sequence number or payload, carrying only ack information.
    pub fn send_ack(&mut self, channel_id: u8, transmitter: &mut impl PacketTransmitter) -> anyhow::Result<()> {
        Self::check_channel_id(channel_id)?;

        let (ack, ack_bits) = self.received_packets.generate_ack_bits();
        let header = PacketHeader::pure_ack(channel_id, ack, ack_bits);
        trace!("{}: sending {:?}", self.config.name, header);

        self.transmit_buf.clear();
        header.ser(&mut self.transmit_buf);
        transmitter.transmit_packet(&self.transmit_buf);
        Ok(())
    }

    /// Sends a payload as a single packet or, if it exceeds the fragment threshold, as a sequence
    ///  of fragments. Returns the packet's sequence number for correlation with acks.
    pub fn send_packet(&mut self, payload: &[u8], channel_id: u8, transmitter: &mut impl PacketTransmitter) -> anyhow::Result<u16> {
        Self::check_channel_id(channel_id)?;
        if payload.len() > self.config.max_packet_size {
            bail!("packet is too large to send: {} bytes, max packet size is {} bytes", payload.len(), self.config.max_packet_size);
        }

        let is_fragmented = payload.len() > self.config.fragment_threshold;
        let num_fragments = payload.len().div_ceil(self.config.fragment_size);
        if is_fragmented && num_fragments > self.config.max_fragments {
            bail!("packet of {} bytes requires {} fragments, max is {}", payload.len(), num_fragments, self.config.max_fragments);
        }

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let (ack, ack_bits) = self.received_packets.generate_ack_bits();

        if let Some(sent) = self.sent_packets.insert(sequence) {
            sent.time = self.time;
            sent.packet_bytes = self.config.packet_header_size + payload.len();
            sent.acked = false;
        }

        let header = PacketHeader::regular(channel_id, sequence, ack, ack_bits);

        if !is_fragmented {
            trace!("{}: sending {:?} with {} bytes", self.config.name, header, payload.len());

            self.transmit_buf.clear();
            header.ser(&mut self.transmit_buf);
            self.transmit_buf.extend_from_slice(payload);
            transmitter.transmit_packet(&self.transmit_buf);
        }
        else {
            trace!("{}: sending {:?} with {} bytes in {} fragments", self.config.name, header, payload.len(), num_fragments);

            for (fragment_id, chunk) in payload.chunks(self.config.fragment_size).enumerate() {
                let fragment_header = FragmentHeader {
                    channel_id,
                    sequence,
                    fragment_id: fragment_id.prechecked_cast(),
                    num_fragments: num_fragments.prechecked_cast(),
                };

                self.transmit_buf.clear();
                fragment_header.ser(&mut self.transmit_buf);
                if fragment_id == 0 {
                    header.ser(&mut self.transmit_buf);
                }
                self.transmit_buf.extend_from_slice(chunk);
                transmitter.transmit_packet(&self.transmit_buf);
            }
        }

        Ok(sequence)
    }

    /// Handles an incoming datagram. Stale and duplicate packets are dropped silently; malformed
    ///  datagrams are rejected as a whole with an error.
    pub fn receive_packet(&mut self, datagram: &[u8], receiver: &mut impl PacketReceiver) -> anyhow::Result<()> {
        if datagram.is_empty() {
            bail!("empty datagram");
        }
        if datagram.len() > self.config.max_datagram_size() {
            bail!("datagram of {} bytes is larger than a peer could have sent (max packet size {})", datagram.len(), self.config.max_packet_size);
        }

        if is_fragment(datagram) {
            self.receive_fragment(datagram, receiver)
        }
        else {
            self.receive_regular(datagram, receiver)
        }
    }

    fn receive_regular(&mut self, datagram: &[u8], receiver: &mut impl PacketReceiver) -> anyhow::Result<()> {
        let mut buf = datagram;
        let header = PacketHeader::deser(&mut buf)?;
        let payload = buf;

        match header.sequence {
            Some(sequence) => {
                if self.received_packets.test_insert(sequence) {
                    trace!("{}: received {:?} with {} bytes", self.config.name, header, payload.len());
                    receiver.process_packet(sequence, payload)?;

                    if let Some(received) = self.received_packets.insert(sequence) {
                        received.time = self.time;
                        received.packet_bytes = self.config.packet_header_size + datagram.len();
                    }
                }
                else {
                    debug!("{}: dropping stale packet {:?}", self.config.name, header);
                }
            }
            None => {
                trace!("{}: received {:?}", self.config.name, header);
            }
        }

        self.process_acks(header.ack, header.ack_bits, receiver);
        Ok(())
    }

    fn process_acks(&mut self, ack: u16, ack_bits: u32, receiver: &mut impl PacketReceiver) {
        for i in 0..32u16 {
            if ack_bits & (1 << i) == 0 {
                continue;
            }

            let ack_sequence = ack.wrapping_sub(i);
            let Some(sent) = self.sent_packets.find_mut(ack_sequence) else {
                continue;
            };
            if sent.acked {
                continue;
            }

            sent.acked = true;
            let rtt_sample = self.time.saturating_sub(sent.time).as_secs_f32() * 1000.0;

            trace!("{}: packet #{} acked after {}ms", self.config.name, ack_sequence, rtt_sample);
            receiver.ack_packet(ack_sequence);

            let rtt = self.stats.rtt_millis;
            self.stats.rtt_millis = if (rtt == 0.0 && rtt_sample > 0.0) || (rtt - rtt_sample).abs() < Self::SMOOTHING_EPSILON {
                rtt_sample
            }
            else {
                rtt + (rtt_sample - rtt) * self.config.rtt_smoothing_factor
            };
        }
    }

    fn receive_fragment(&mut self, datagram: &[u8], receiver: &mut impl PacketReceiver) -> anyhow::Result<()> {
        let fragment_size = self.config.fragment_size;
        let fragment = read_fragment(datagram, self.config.max_fragments, fragment_size)?;
        let sequence = fragment.header.sequence;
        let num_fragments = fragment.header.num_fragments as usize;

        if !self.fragment_reassembly.exists(sequence) {
            match self.fragment_reassembly.insert(sequence) {
                Some(reassembly) => reassembly.init(num_fragments, fragment_size),
                None => {
                    debug!("{}: dropping stale fragment {:?}", self.config.name, fragment.header);
                    return Ok(());
                }
            }
        }

        let Some(reassembly) = self.fragment_reassembly.find_mut(sequence) else {
            return Ok(());
        };

        if reassembly.num_fragments_total != num_fragments {
            debug!("{}: dropping fragment {:?}, expected {} fragments", self.config.name, fragment.header, reassembly.num_fragments_total);
            return Ok(());
        }
        if !reassembly.store(&fragment, fragment_size) {
            debug!("{}: dropping duplicate fragment {:?}", self.config.name, fragment.header);
            return Ok(());
        }
        trace!("{}: stored fragment {:?}", self.config.name, fragment.header);

        if !reassembly.is_complete() {
            return Ok(());
        }

        let mut packet = std::mem::take(&mut self.reassembled_packet);
        packet.clear();
        packet.extend_from_slice(reassembly.packet());
        self.fragment_reassembly.remove(sequence);

        trace!("{}: reassembled packet #{} from {} fragments", self.config.name, sequence, num_fragments);
        let result = self.receive_regular(&packet, receiver);
        self.reassembled_packet = packet;
        result
    }

    /// Advances the controller's clock and recomputes the smoothed statistics over the older half
    ///  of the sent and received packet windows.
    pub fn update(&mut self, time: Duration) {
        self.time = time;

        let sent_window = Self::older_half_of_window(&self.sent_packets);
        let num_samples = sent_window.len();
        if num_samples > 0 {
            let num_dropped = sent_window.clone()
                .filter_map(|seq| self.sent_packets.find(seq))
                .filter(|sent| !sent.acked)
                .count();
            let packet_loss = num_dropped as f32 / num_samples as f32;
            self.stats.packet_loss = Self::smooth(self.stats.packet_loss, packet_loss, self.config.packet_loss_smoothing_factor);
        }

        let sent_bandwidth = Self::bandwidth_kbps(sent_window.clone()
            .filter_map(|seq| self.sent_packets.find(seq))
            .map(|sent| (sent.time, sent.packet_bytes)));
        if let Some(sent_bandwidth) = sent_bandwidth {
            self.stats.sent_bandwidth_kbps = Self::smooth(self.stats.sent_bandwidth_kbps, sent_bandwidth, self.config.bandwidth_smoothing_factor);
        }

        let acked_bandwidth = Self::bandwidth_kbps(sent_window
            .filter_map(|seq| self.sent_packets.find(seq))
            .filter(|sent| sent.acked)
            .map(|sent| (sent.time, sent.packet_bytes)));
        if let Some(acked_bandwidth) = acked_bandwidth {
            self.stats.acked_bandwidth_kbps = Self::smooth(self.stats.acked_bandwidth_kbps, acked_bandwidth, self.config.bandwidth_smoothing_factor);
        }

        let received_bandwidth = Self::bandwidth_kbps(Self::older_half_of_window(&self.received_packets)
            .filter_map(|seq| self.received_packets.find(seq))
            .map(|received| (received.time, received.packet_bytes)));
        if let Some(received_bandwidth) = received_bandwidth {
            self.stats.received_bandwidth_kbps = Self::smooth(self.stats.received_bandwidth_kbps, received_bandwidth, self.config.bandwidth_smoothing_factor);
        }
    }

    fn older_half_of_window<T>(buffer: &SequenceBuffer<T>) -> impl ExactSizeIterator<Item = u16> + Clone {
        let capacity = buffer.capacity();
        let base = buffer.sequence().wrapping_sub(capacity.prechecked_cast());
        (0..capacity / 2)
            .map(move |offset| base.wrapping_add(offset.prechecked_cast()))
    }

    /// `None` if the samples do not span a positive time interval
    fn bandwidth_kbps(samples: impl Iterator<Item = (Duration, usize)>) -> Option<f32> {
        let mut bytes = 0;
        let mut span: Option<(Duration, Duration)> = None;
        for (time, packet_bytes) in samples {
            bytes += packet_bytes;
            span = Some(match span {
                None => (time, time),
                Some((start, finish)) => (start.min(time), finish.max(time)),
            });
        }

        let (start, finish) = span?;
        if finish <= start {
            return None;
        }
        Some(bytes as f32 * 8.0 / 1000.0 / (finish - start).as_secs_f32())
    }

    fn smooth(current: f32, sample: f32, factor: f32) -> f32 {
        if (current - sample).abs() > Self::SMOOTHING_EPSILON {
            current + (sample - current) * factor
        }
        else {
            sample
        }
    }

    fn check_channel_id(channel_id: u8) -> anyhow::Result<()> {
        if channel_id > MAX_CHANNEL_ID {
            bail!("channel id {} exceeds maximum of {}", channel_id, MAX_CHANNEL_ID);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rstest::rstest;

    impl PacketTransmitter for Vec<Vec<u8>> {
        fn transmit_packet(&mut self, datagram: &[u8]) {
            self.push(datagram.to_vec());
        }
    }

    #[derive(Default)]
    struct RecordingReceiver {
        pub processed: Vec<(u16, Vec<u8>)>,
        pub acked: Vec<u16>,
    }

    impl PacketReceiver for RecordingReceiver {
        fn process_packet(&mut self, sequence: u16, payload: &[u8]) -> anyhow::Result<()> {
            self.processed.push((sequence, payload.to_vec()));
            Ok(())
        }

        fn ack_packet(&mut self, sequence: u16) {
            self.acked.push(sequence);
        }
    }

    fn controller() -> PacketController {
        PacketController::new(ReliableConfig::default_config(), Duration::ZERO).unwrap()
    }

    /// statistics reflect the most recent sample only
    fn controller_without_smoothing() -> PacketController {
        let mut config = ReliableConfig::default_config();
        config.packet_loss_smoothing_factor = 1.0;
        config.bandwidth_smoothing_factor = 1.0;
        PacketController::new(config, Duration::ZERO).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_send_single_packet() {
        let mut controller = controller();

        let mut transmitter = MockPacketTransmitter::new();
        transmitter.expect_transmit_packet()
            .once()
            .withf(|datagram: &[u8]| datagram == [0b0011_1110, 1, 0,0, 1, 0,0,0,0, 7,8,9])
            .return_const(());

        assert_eq!(controller.send_packet(&[7,8,9], 1, &mut transmitter).unwrap(), 0);
        assert_eq!(controller.next_packet_sequence(), 1);
    }

    #[rstest]
    #[case::too_big(16 * 1024 + 1, 0)]
    #[case::bad_channel(10, 4)]
    fn test_send_rejected(#[case] len: usize, #[case] channel_id: u8) {
        let mut controller = controller();
        let mut transmitter = MockPacketTransmitter::new();

        assert!(controller.send_packet(&payload(len), channel_id, &mut transmitter).is_err());
        assert_eq!(controller.next_packet_sequence(), 0);
    }

    #[test]
    fn test_send_max_size_fragmented() {
        let mut config = ReliableConfig::default_config();
        config.max_fragments = 4;
        config.max_packet_size = 4096;
        let mut controller = PacketController::new(config, Duration::ZERO).unwrap();

        let mut transmitter = MockPacketTransmitter::new();
        transmitter.expect_transmit_packet()
            .times(4)
            .return_const(());
        assert!(controller.send_packet(&payload(4096), 0, &mut transmitter).is_ok());

        let mut transmitter = MockPacketTransmitter::new();
        assert!(controller.send_packet(&payload(4097), 0, &mut transmitter).is_err());
    }

    #[rstest]
    #[case::at_threshold(1024, 1)]
    #[case::just_above_threshold(1025, 2)]
    #[case::max_size(16 * 1024, 16)]
    fn test_fragment_count(#[case] len: usize, #[case] expected_datagrams: usize) {
        let mut controller = controller();
        let mut sent = Vec::<Vec<u8>>::new();
        controller.send_packet(&payload(len), 0, &mut sent).unwrap();
        assert_eq!(sent.len(), expected_datagrams);
    }

    #[derive(Debug, Clone, Copy)]
    enum FragmentOrder {
        InOrder,
        Reverse,
        Shuffled(u64),
    }

    #[rstest]
    fn test_fragmentation_round_trip(
        #[values(1, 2, 5, 15)] num_full_fragments: usize,
        #[values(1, 100, 1023)] remainder: usize,
        #[values(FragmentOrder::InOrder, FragmentOrder::Reverse, FragmentOrder::Shuffled(1), FragmentOrder::Shuffled(2))] order: FragmentOrder,
    ) {
        let fragment_size = ReliableConfig::default_config().fragment_size;
        let original = payload(num_full_fragments * fragment_size + remainder);

        let mut sender = controller();
        let mut datagrams = Vec::<Vec<u8>>::new();
        let sequence = sender.send_packet(&original, 2, &mut datagrams).unwrap();
        assert_eq!(datagrams.len(), num_full_fragments + 1);

        match order {
            FragmentOrder::InOrder => {},
            FragmentOrder::Reverse => datagrams.reverse(),
            FragmentOrder::Shuffled(seed) => datagrams.shuffle(&mut StdRng::seed_from_u64(seed)),
        }

        let mut receiver_controller = controller();
        let mut receiver = RecordingReceiver::default();
        for datagram in &datagrams {
            receiver_controller.receive_packet(datagram, &mut receiver).unwrap();
        }

        assert_eq!(receiver.processed, vec![(sequence, original)]);
    }

    #[test]
    fn test_duplicate_fragments_are_ignored() {
        let mut sender = controller();
        let mut datagrams = Vec::<Vec<u8>>::new();
        sender.send_packet(&payload(3000), 0, &mut datagrams).unwrap();
        assert_eq!(datagrams.len(), 3);

        let mut receiver_controller = controller();
        let mut receiver = MockPacketReceiver::new();
        receiver.expect_process_packet()
            .once()
            .withf(|sequence, data| *sequence == 0 && data.len() == 3000)
            .returning(|_, _| Ok(()));

        for i in [0, 0, 1, 1, 0, 2, 2, 1] {
            receiver_controller.receive_packet(&datagrams[i], &mut receiver).unwrap();
        }
    }

    #[test]
    fn test_mismatched_fragment_count_is_dropped() {
        let mut sender = controller();
        let mut datagrams = Vec::<Vec<u8>>::new();
        sender.send_packet(&payload(3000), 0, &mut datagrams).unwrap();

        // same sequence, but announcing 4 fragments
        let mut bogus = datagrams[1].clone();
        bogus[4] = 3;

        let mut receiver_controller = controller();
        let mut receiver = RecordingReceiver::default();
        receiver_controller.receive_packet(&datagrams[0], &mut receiver).unwrap();
        receiver_controller.receive_packet(&bogus, &mut receiver).unwrap();
        assert!(receiver.processed.is_empty());

        receiver_controller.receive_packet(&datagrams[1], &mut receiver).unwrap();
        receiver_controller.receive_packet(&datagrams[2], &mut receiver).unwrap();
        assert_eq!(receiver.processed.len(), 1);
    }

    #[test]
    fn test_stale_fragment_is_dropped() {
        let mut config = ReliableConfig::default_config();
        config.fragment_reassembly_buffer_size = 4;
        let mut sender = PacketController::new(config.clone(), Duration::ZERO).unwrap();
        let mut receiver_controller = PacketController::new(config, Duration::ZERO).unwrap();
        let mut receiver = RecordingReceiver::default();

        let mut first = Vec::<Vec<u8>>::new();
        sender.send_packet(&payload(2000), 0, &mut first).unwrap();
        for _ in 0..9 {
            sender.send_packet(&payload(10), 0, &mut Vec::<Vec<u8>>::new()).unwrap();
        }
        let mut latest = Vec::<Vec<u8>>::new();
        sender.send_packet(&payload(2000), 0, &mut latest).unwrap();

        receiver_controller.receive_packet(&latest[0], &mut receiver).unwrap();
        receiver_controller.receive_packet(&first[0], &mut receiver).unwrap();
        receiver_controller.receive_packet(&first[1], &mut receiver).unwrap();
        assert!(receiver.processed.is_empty());

        receiver_controller.receive_packet(&latest[1], &mut receiver).unwrap();
        assert_eq!(receiver.processed.len(), 1);
        assert_eq!(receiver.processed[0].0, 10);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![0b0000_0000, 0, 0])]
    #[case::bad_fragment(vec![0b0000_0001, 0,0, 5, 1])]
    #[case::oversized(vec![0u8; 16 * 1024 + 16])]
    fn test_receive_format_errors(#[case] datagram: Vec<u8>) {
        let mut controller = controller();
        let mut receiver = MockPacketReceiver::new();
        assert!(controller.receive_packet(&datagram, &mut receiver).is_err());
    }

    #[test]
    fn test_process_error_does_not_record_packet() {
        let mut sender = controller();
        let mut datagrams = Vec::<Vec<u8>>::new();
        sender.send_packet(&[1,2,3], 0, &mut datagrams).unwrap();

        let mut receiver_controller = controller();
        let mut receiver = MockPacketReceiver::new();
        receiver.expect_process_packet()
            .times(2)
            .returning(|_, _| Err(anyhow::anyhow!("corrupt")));
        assert!(receiver_controller.receive_packet(&datagrams[0], &mut receiver).is_err());
        assert!(receiver_controller.receive_packet(&datagrams[0], &mut receiver).is_err());
    }

    #[test]
    fn test_stale_packet_is_not_processed_but_acks_are() {
        let mut a = controller();
        let mut b = controller();

        // b sends 300 packets, a only receives the last one and an old one
        let mut from_b = Vec::<Vec<u8>>::new();
        for _ in 0..300 {
            b.send_packet(&[1], 0, &mut from_b).unwrap();
        }

        let mut a_receiver = RecordingReceiver::default();
        a.receive_packet(&from_b[299], &mut a_receiver).unwrap();
        assert_eq!(a_receiver.processed.len(), 1);

        // a sends a packet, which b acks in an otherwise stale packet
        let mut from_a = Vec::<Vec<u8>>::new();
        a.send_packet(&[2], 0, &mut from_a).unwrap();
        let mut b_receiver = RecordingReceiver::default();
        b.receive_packet(&from_a[0], &mut b_receiver).unwrap();

        let mut ack_from_b = Vec::<Vec<u8>>::new();
        b.send_packet(&[3], 0, &mut ack_from_b).unwrap();
        // rewrite the sequence number to something far outside a's window. The ack trails the
        //  sequence by more than 255, so it is a full u16 and unaffected by the rewrite
        ack_from_b[0][2] = 0;
        ack_from_b[0][3] = 0;
        a.receive_packet(&ack_from_b[0], &mut a_receiver).unwrap();

        assert_eq!(a_receiver.processed.len(), 1);
        assert_eq!(a_receiver.acked, vec![0]);
    }

    #[test]
    fn test_ack_and_rtt() {
        let mut a = controller();
        let mut b = controller();
        let mut a_receiver = RecordingReceiver::default();
        let mut b_receiver = RecordingReceiver::default();

        let mut from_a = Vec::<Vec<u8>>::new();
        a.send_packet(&[1], 0, &mut from_a).unwrap();
        a.send_packet(&[2], 0, &mut from_a).unwrap();

        b.receive_packet(&from_a[0], &mut b_receiver).unwrap();
        b.receive_packet(&from_a[1], &mut b_receiver).unwrap();

        let mut from_b = Vec::<Vec<u8>>::new();
        b.send_ack(0, &mut from_b).unwrap();

        a.update(Duration::from_millis(100));
        a.receive_packet(&from_b[0], &mut a_receiver).unwrap();

        assert_eq!(a_receiver.acked, vec![1, 0]);
        assert!(a_receiver.processed.is_empty());
        assert!((a.rtt() - 100.0).abs() < 0.01);

        // acks are reported only once
        a.receive_packet(&from_b[0], &mut a_receiver).unwrap();
        assert_eq!(a_receiver.acked, vec![1, 0]);

        // rtt is smoothed with the configured factor
        a.send_packet(&[3], 0, &mut from_a).unwrap();
        b.receive_packet(&from_a[2], &mut b_receiver).unwrap();
        b.send_ack(0, &mut from_b).unwrap();
        a.update(Duration::from_millis(300));
        a.receive_packet(&from_b[1], &mut a_receiver).unwrap();

        assert_eq!(a_receiver.acked, vec![1, 0, 2]);
        assert!((a.rtt() - (100.0 + (200.0 - 100.0) * 0.25)).abs() < 0.01);
    }

    #[test]
    fn test_pure_ack_is_not_recorded_as_received() {
        let mut a = controller();
        let mut b = controller();

        let mut from_a = Vec::<Vec<u8>>::new();
        a.send_ack(1, &mut from_a).unwrap();
        assert_eq!(from_a[0], vec![0b1001_1110, 1, 0xff,0xff, 0,0,0,0]);
        assert_eq!(a.next_packet_sequence(), 0);

        let mut receiver = MockPacketReceiver::new();
        b.receive_packet(&from_a[0], &mut receiver).unwrap();
        b.receive_packet(&from_a[0], &mut receiver).unwrap();

        let mut from_b = Vec::<Vec<u8>>::new();
        b.send_ack(1, &mut from_b).unwrap();
        assert_eq!(from_b[0], from_a[0]);
    }

    #[test]
    fn test_ack_bits_reflect_received_packets() {
        let mut a = controller();
        let mut b = controller();
        let mut from_a = Vec::<Vec<u8>>::new();
        for i in 0..5u8 {
            a.send_packet(&[i], 0, &mut from_a).unwrap();
        }

        let mut b_receiver = RecordingReceiver::default();
        for i in [0, 1, 3, 4] {
            b.receive_packet(&from_a[i], &mut b_receiver).unwrap();
        }

        let mut from_b = Vec::<Vec<u8>>::new();
        b.send_ack(0, &mut from_b).unwrap();
        let mut buf: &[u8] = &from_b[0];
        let header = PacketHeader::deser(&mut buf).unwrap();
        assert_eq!(header.ack, 4);
        assert_eq!(header.ack_bits, 0b11011);

        let mut a_receiver = RecordingReceiver::default();
        a.receive_packet(&from_b[0], &mut a_receiver).unwrap();
        assert_eq!(a_receiver.acked, vec![4, 3, 1, 0]);
    }

    #[test]
    fn test_update_stats() {
        let mut a = controller_without_smoothing();
        let mut sent = Vec::<Vec<u8>>::new();
        for i in 0..256u64 {
            a.update(Duration::from_millis(10 * i));
            a.send_packet(&payload(100), 0, &mut sent).unwrap();
        }
        a.update(Duration::from_secs(3));

        // none of the older half was acked
        assert!((a.packet_loss() - 1.0).abs() < 0.0001);

        // sequences 0..128, sent at 0ms..1270ms
        let expected_sent = 128.0 * 128.0 * 8.0 / 1000.0 / 1.27;
        assert!((a.sent_bandwidth_kbps() - expected_sent).abs() < 0.01, "{}", a.sent_bandwidth_kbps());
        assert_eq!(a.acked_bandwidth_kbps(), 0.0);
        assert_eq!(a.received_bandwidth_kbps(), 0.0);

        let stats = a.stats();
        assert_eq!(stats.packet_loss, a.packet_loss());
        assert_eq!(stats.sent_bandwidth_kbps, a.sent_bandwidth_kbps());
    }

    #[test]
    fn test_received_bandwidth() {
        let mut a = controller();
        let mut b = controller_without_smoothing();
        let mut receiver = RecordingReceiver::default();

        for i in 0..256u64 {
            let mut sent = Vec::<Vec<u8>>::new();
            a.send_packet(&payload(72), 0, &mut sent).unwrap();
            b.update(Duration::from_millis(20 * i));
            b.receive_packet(&sent[0], &mut receiver).unwrap();
        }
        b.update(Duration::from_secs(10));

        // each datagram is 72 bytes + 9 header bytes (including four mask bytes, since a never
        //  received anything)
        let datagram_len = 72 + 9;
        let expected = 128.0 * (28.0 + datagram_len as f32) * 8.0 / 1000.0 / 2.54;
        assert!((b.received_bandwidth_kbps() - expected).abs() < 0.01, "{}", b.received_bandwidth_kbps());
    }

    #[test]
    fn test_reset() {
        let mut a = controller();
        let mut sent = Vec::<Vec<u8>>::new();
        a.send_packet(&[1], 0, &mut sent).unwrap();
        a.send_packet(&[1], 0, &mut sent).unwrap();
        a.reset();
        assert_eq!(a.next_packet_sequence(), 0);
        assert_eq!(a.stats(), NetworkStats::default());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut a = controller();
        let mut b = controller();
        let mut receiver = RecordingReceiver::default();
        for _ in 0..70_000 {
            let mut sent = Vec::<Vec<u8>>::new();
            a.send_packet(&[], 0, &mut sent).unwrap();
            b.receive_packet(&sent[0], &mut receiver).unwrap();
        }
        assert_eq!(receiver.processed.len(), 70_000);
        assert_eq!(receiver.processed.last().unwrap().0, (70_000 - 1) as u16);
    }

    #[test]
    fn test_mock_receiver_gets_sequence_and_payload() {
        let mut a = controller();
        let mut b = controller();
        let mut sent = Vec::<Vec<u8>>::new();
        a.send_packet(&[9,9], 0, &mut sent).unwrap();
        a.send_packet(&[8], 0, &mut sent).unwrap();

        let mut receiver = MockPacketReceiver::new();
        receiver.expect_process_packet()
            .once()
            .withf(|sequence, data| *sequence == 1 && data == [8u8])
            .returning(|_, _| Ok(()));
        b.receive_packet(&sent[1], &mut receiver).unwrap();
    }
}
