use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};

bitflags! {
    /// prefix byte of a regular or pure-ack packet
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct Flags: u8 {
        const FRAGMENT = 0b0000_0001;

        const ACK_BITS_0 = 0b0000_0010;
        const ACK_BITS_1 = 0b0000_0100;
        const ACK_BITS_2 = 0b0000_1000;
        const ACK_BITS_3 = 0b0001_0000;

        const ACK_DIFF = 0b0010_0000;
        const RESERVED = 0b0100_0000;
        const PURE_ACK = 0b1000_0000;
    }
}

/// one flag per byte of the ack bitmask, least significant byte first
const ACK_BITS_FLAGS: [Flags; 4] = [Flags::ACK_BITS_0, Flags::ACK_BITS_1, Flags::ACK_BITS_2, Flags::ACK_BITS_3];

const FRAGMENT_PREFIX_RESERVED: u8 = 0b0011_1110;
const FRAGMENT_CHANNEL_SHIFT: u8 = 6;

pub const MAX_CHANNEL_ID: u8 = 3;

/// prefix + channel + sequence + full ack + all four ack bitmask bytes
pub const MAX_PACKET_HEADER_BYTES: usize = 10;

/// prefix + sequence + fragment id + fragment count
pub const FRAGMENT_HEADER_BYTES: usize = 5;

/// Header of a regular packet, or of a pure acknowledgement packet if `sequence` is `None`.
///
/// The ack bitmask is sparsified on the wire: only bytes that are not `0xFF` are transmitted, and
///  the prefix flags say which ones.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub channel_id: u8,
    pub sequence: Option<u16>,
    pub ack: u16,
    pub ack_bits: u32,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.sequence {
            Some(sequence) => write!(f, "PCKT{{C{}:#{} ack {}/{:08x}}}", self.channel_id, sequence, self.ack, self.ack_bits),
            None => write!(f, "ACK{{C{}: ack {}/{:08x}}}", self.channel_id, self.ack, self.ack_bits),
        }
    }
}

impl PacketHeader {
    pub fn regular(channel_id: u8, sequence: u16, ack: u16, ack_bits: u32) -> PacketHeader {
        PacketHeader {
            channel_id,
            sequence: Some(sequence),
            ack,
            ack_bits,
        }
    }

    pub fn pure_ack(channel_id: u8, ack: u16, ack_bits: u32) -> PacketHeader {
        PacketHeader {
            channel_id,
            sequence: None,
            ack,
            ack_bits,
        }
    }

    pub fn is_pure_ack(&self) -> bool {
        self.sequence.is_none()
    }

    fn flags(&self) -> Flags {
        let mut flags = Flags::empty();
        for (i, flag) in ACK_BITS_FLAGS.iter().enumerate() {
            if (self.ack_bits >> (8 * i)) & 0xff != 0xff {
                flags |= *flag;
            }
        }

        match self.sequence {
            None => flags |= Flags::PURE_ACK,
            Some(sequence) => {
                if sequence.wrapping_sub(self.ack) <= u8::MAX as u16 {
                    flags |= Flags::ACK_DIFF;
                }
            }
        }
        flags
    }

    pub fn serialized_len(&self) -> usize {
        let flags = self.flags();

        let sequence_len = if self.sequence.is_some() { size_of::<u16>() } else { 0 };
        let ack_len = if flags.contains(Flags::ACK_DIFF) { size_of::<u8>() } else { size_of::<u16>() };
        let ack_bits_len = ACK_BITS_FLAGS.iter()
            .filter(|flag| flags.contains(**flag))
            .count();

        size_of::<u8>()      // prefix
            + size_of::<u8>() // channel id
            + sequence_len
            + ack_len
            + ack_bits_len
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.channel_id <= MAX_CHANNEL_ID);

        let flags = self.flags();
        buf.put_u8(flags.bits());
        buf.put_u8(self.channel_id);

        if let Some(sequence) = self.sequence {
            buf.put_u16(sequence);
        }

        if flags.contains(Flags::ACK_DIFF) {
            if let Some(sequence) = self.sequence {
                buf.put_u8(sequence.wrapping_sub(self.ack) as u8);
            }
        }
        else {
            buf.put_u16(self.ack);
        }

        for (i, flag) in ACK_BITS_FLAGS.iter().enumerate() {
            if flags.contains(*flag) {
                buf.put_u8((self.ack_bits >> (8 * i)) as u8);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let flags = Flags::from_bits_retain(buf.try_get_u8()?);
        if flags.contains(Flags::FRAGMENT) {
            bail!("header does not indicate a regular packet");
        }
        if flags.contains(Flags::RESERVED) {
            bail!("reserved header bit is set");
        }

        let channel_id = buf.try_get_u8()?;
        if channel_id > MAX_CHANNEL_ID {
            bail!("invalid channel id {}", channel_id);
        }

        let (sequence, ack) = if flags.contains(Flags::PURE_ACK) {
            if flags.contains(Flags::ACK_DIFF) {
                bail!("pure ack packet can not encode its ack as a diff");
            }
            (None, buf.try_get_u16()?)
        }
        else {
            let sequence = buf.try_get_u16()?;
            let ack = if flags.contains(Flags::ACK_DIFF) {
                sequence.wrapping_sub(buf.try_get_u8()? as u16)
            }
            else {
                buf.try_get_u16()?
            };
            (Some(sequence), ack)
        };

        let mut ack_bits = u32::MAX;
        for (i, flag) in ACK_BITS_FLAGS.iter().enumerate() {
            if flags.contains(*flag) {
                let shift = 8 * i;
                ack_bits &= !(0xff << shift);
                ack_bits |= (buf.try_get_u8()? as u32) << shift;
            }
        }

        Ok(PacketHeader {
            channel_id,
            sequence,
            ack,
            ack_bits,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    pub channel_id: u8,
    pub sequence: u16,
    pub fragment_id: u8,
    /// 1 ..= 256, transmitted as `num_fragments - 1`
    pub num_fragments: u16,
}

impl FragmentHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.channel_id <= MAX_CHANNEL_ID);
        debug_assert!(self.num_fragments >= 1 && self.num_fragments <= 256);

        buf.put_u8(Flags::FRAGMENT.bits() | (self.channel_id << FRAGMENT_CHANNEL_SHIFT));
        buf.put_u16(self.sequence);
        buf.put_u8(self.fragment_id);
        buf.put_u8((self.num_fragments - 1) as u8);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let prefix = buf.try_get_u8()?;
        if prefix & Flags::FRAGMENT.bits() == 0 {
            bail!("header does not indicate a fragment packet");
        }
        if prefix & FRAGMENT_PREFIX_RESERVED != 0 {
            bail!("reserved fragment header bits are set: {:02x}", prefix);
        }

        let sequence = buf.try_get_u16()?;
        let fragment_id = buf.try_get_u8()?;
        let num_fragments = buf.try_get_u8()? as u16 + 1;

        Ok(FragmentHeader {
            channel_id: prefix >> FRAGMENT_CHANNEL_SHIFT,
            sequence,
            fragment_id,
            num_fragments,
        })
    }
}

/// A fragment datagram that passed all structural checks
#[derive(Debug)]
pub struct ParsedFragment<'a> {
    pub header: FragmentHeader,
    /// the raw regular header of the reassembled packet, present in fragment 0 only
    pub packet_header: Option<&'a [u8]>,
    pub payload: &'a [u8],
}

/// Parses and validates a fragment datagram. Fragment metadata that is inconsistent with the
///  configured limits, or a fragment 0 whose embedded packet header does not match the fragment
///  header, is a format error.
pub fn read_fragment(datagram: &[u8], max_fragments: usize, fragment_size: usize) -> anyhow::Result<ParsedFragment<'_>> {
    let mut buf = datagram;
    let header = FragmentHeader::deser(&mut buf)?;

    if header.num_fragments as usize > max_fragments {
        bail!("fragment count {} exceeds maximum of {}", header.num_fragments, max_fragments);
    }
    if header.fragment_id as u16 >= header.num_fragments {
        bail!("fragment id {} outside of fragment count {}", header.fragment_id, header.num_fragments);
    }

    let packet_header = if header.fragment_id == 0 {
        let before = buf;
        let inner = PacketHeader::deser(&mut buf)?;
        if inner.sequence != Some(header.sequence) {
            bail!("bad packet sequence in fragment: {:?} vs fragment #{}", inner, header.sequence);
        }
        if inner.channel_id != header.channel_id {
            bail!("bad channel id in fragment: {:?} vs fragment channel {}", inner, header.channel_id);
        }
        Some(&before[..before.len() - buf.len()])
    }
    else {
        None
    };

    let payload = buf;
    if payload.len() > fragment_size {
        bail!("fragment has {} bytes, more than the fragment size of {}", payload.len(), fragment_size);
    }
    if header.fragment_id as u16 != header.num_fragments - 1 && payload.len() != fragment_size {
        bail!("non-final fragment has {} bytes instead of {}", payload.len(), fragment_size);
    }

    Ok(ParsedFragment {
        header,
        packet_header,
        payload,
    })
}

/// Checks the prefix byte, which is all that is needed to route a datagram to regular or fragment
///  handling
pub fn is_fragment(datagram: &[u8]) -> bool {
    datagram.first()
        .map(|prefix| prefix & Flags::FRAGMENT.bits() != 0)
        .unwrap_or(false)
}

/// Extracts the channel id from a datagram without decoding it fully
pub fn channel_id_of(datagram: &[u8]) -> anyhow::Result<u8> {
    let Some(&prefix) = datagram.first() else {
        bail!("empty datagram");
    };

    if is_fragment(datagram) {
        Ok(prefix >> FRAGMENT_CHANNEL_SHIFT)
    }
    else {
        match datagram.get(1) {
            Some(&channel_id) => Ok(channel_id),
            None => bail!("buffer too small for packet header"),
        }
    }
}
