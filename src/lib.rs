//! A reliability and fragmentation layer for UDP, providing three qualities of service over a
//!  single pair of sockets: reliable and ordered, unreliable, and unreliable but ordered.
//!
//! The library does no I/O and does not read a clock. The application passes in received
//!  datagrams and the current time, and gets datagrams to send plus received messages back through
//!  a [message_channel::ChannelSink]. That makes all of it deterministic given the sequence of
//!  inputs, which is what the tests rely on.
//!
//! ## Design goals
//!
//! * Several channels with different delivery guarantees share a connection, each with its own
//!    sequence space. The channel id travels in every packet header.
//! * Packets carry sequence numbers and piggyback acknowledgement of the peer's most recent 33
//!    packets (`ack` plus a 32 bit mask), so acks are highly redundant and need no packets of
//!    their own as long as there is traffic in both directions
//! * Payloads above a configured threshold are split into fragments and reassembled by the
//!    receiver, avoiding IP level fragmentation
//! * The reliable channel resends messages rather than packets: every flush bundles all
//!    unacknowledged messages that were not sent recently, so there is no per-packet
//!    retransmission state
//! * There is no handshake and no notion of connection state; peers sync on the go
//! * Headers are as compact as possible, e.g. ack mask bytes that are all ones are omitted
//!
//! ## Header
//!
//! All numbers are in network byte order (BE).
//!
//! Regular packet header:
//! ```ascii
//! 0: prefix (u8)
//!    * bit 0: 0 (otherwise this is a fragment, see below)
//!    * bit 1-4: ack mask byte 0-3 is present. An absent byte is 0xff
//!    * bit 5: ack is encoded as a one byte diff relative to the sequence number
//!    * bit 6: reserved, must be 0
//!    * bit 7: pure ack - no sequence number and no payload
//! 1: channel id (u8, 0-3)
//! 2: sequence number (u16) - not present for pure acks
//! *: ack (u8 diff or u16)
//! *: ack mask bytes, low byte first
//! ```
//!
//! This adds between 4 and 10 bytes per packet.
//!
//! Fragment header:
//! ```ascii
//! 0: prefix (u8)
//!    * bit 0: 1
//!    * bit 1-5: must be 0
//!    * bit 6-7: channel id
//! 1: sequence number (u16)
//! 3: fragment id (u8)
//! 4: number of fragments - 1 (u8)
//! 5: (fragment id 0 only) the regular header of the reassembled packet
//! *: fragment payload
//! ```
//!
//! ## Reliable channel
//!
//! The payload of a reliable channel packet is a sequence of messages, each prefixed with its
//!  message id (u16) and its length (one byte for lengths below 128, otherwise two bytes with the
//!  high bit of the first byte set). See [message_header::MessageHeader].

pub mod config;
pub mod congestion;
pub mod end_point;
pub mod message_channel;
pub mod message_header;
pub mod packet_controller;
pub mod packet_header;
pub mod reliable_channel;
pub mod safe_converter;
pub mod sequence;
pub mod sequence_buffer;
pub mod unreliable_channel;
