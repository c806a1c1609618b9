use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::safe_converter::PrecheckedCast;

/// Framing of a single message inside a reliable channel packet:
///
/// ```ascii
/// 0: message id (u16 BE)
/// 2: message length (1-2 bytes): low 7 bits, with 0x80 set if a second byte follows that
///     holds the remaining `len >> 7`
/// *: message bytes
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: u16,
    pub message_len: u16,
}

impl MessageHeader {
    pub const MAX_MESSAGE_LEN: usize = 0x7fff;

    const CONTINUATION: u8 = 0x80;

    pub fn for_message(message_id: u16, message: &[u8]) -> anyhow::Result<MessageHeader> {
        if message.len() > Self::MAX_MESSAGE_LEN {
            bail!("message length {} exceeds maximum of {}", message.len(), Self::MAX_MESSAGE_LEN);
        }

        Ok(MessageHeader {
            message_id,
            message_len: message.len().prechecked_cast(),
        })
    }

    pub fn serialized_len(&self) -> usize {
        if self.message_len >> 7 != 0 {
            size_of::<u16>() + 2
        }
        else {
            size_of::<u16>() + 1
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.message_len as usize <= Self::MAX_MESSAGE_LEN);

        buf.put_u16(self.message_id);

        let low = (self.message_len & 0x7f) as u8;
        let high = (self.message_len >> 7) as u8;
        if high != 0 {
            buf.put_u8(low | Self::CONTINUATION);
            buf.put_u8(high);
        }
        else {
            buf.put_u8(low);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let message_id = buf.try_get_u16()?;

        let first = buf.try_get_u8()?;
        let mut message_len = (first & 0x7f) as u16;
        if first & Self::CONTINUATION != 0 {
            message_len |= (buf.try_get_u8()? as u16) << 7;
        }

        Ok(MessageHeader {
            message_id,
            message_len,
        })
    }
}

/// Splits a reliable channel packet payload into its `(message id, message bytes)` records.
///
/// The entire payload is validated before anything is returned, so a truncated or corrupt payload
///  is rejected as a whole.
pub fn parse_messages(mut payload: &[u8]) -> anyhow::Result<Vec<(u16, &[u8])>> {
    let mut result = Vec::new();
    while payload.has_remaining() {
        let header = MessageHeader::deser(&mut payload)?;
        let len = header.message_len as usize;
        if payload.len() < len {
            bail!("message #{} announces {} bytes, but only {} remain in the packet", header.message_id, len, payload.len());
        }

        let (message, rest) = payload.split_at(len);
        result.push((header.message_id, message));
        payload = rest;
    }
    Ok(result)
}
