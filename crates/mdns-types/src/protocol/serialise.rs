//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

/// The largest packet this implementation will assemble.  Interface
/// MTU budgets are applied on top of this by the caller.
pub const PACKET_SIZE_MAX: usize = 9000;

/// The largest offset a 14-bit compression pointer can encode.
/// Names at larger offsets are simply not memoised.
pub const COMPRESSION_OFFSET_MAX: usize = 0b0011_1111_1111_1111;

impl Message {
    /// Serialise as a single packet with the default size budget.
    ///
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed) or does not fit the budget.
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid or does not fit the buffer's budget.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer)?;
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }

    /// Serialise into as many packets as the size budget demands.
    ///
    /// Questions go in the first packet.  Records that do not fit are
    /// carried over into follow-up packets, and every packet except
    /// the last has the TC bit set (RFC 6762 section 7.2).  Each
    /// packet gets its own compression pointer table.
    ///
    /// # Errors
    ///
    /// If the question section alone exceeds the budget, or a single
    /// record does not fit in an empty packet.
    pub fn to_packets(&self, limit: usize) -> Result<Vec<BytesMut>, Error> {
        let mut packets = Vec::new();
        let mut packet = PartialPacket::begin(&self.header, limit);

        for question in &self.questions {
            question.serialise(&mut packet.buffer)?;
            packet.qdcount += 1;
        }

        let sections = [
            (Section::Answer, &self.answers),
            (Section::Authority, &self.authority),
            (Section::Additional, &self.additional),
        ];

        for (section, rrs) in sections {
            for rr in rrs.iter() {
                match rr.serialise(&mut packet.buffer) {
                    Ok(()) => packet.count(section),
                    Err(Error::TruncatedPacket) => {
                        if packet.is_empty() {
                            // a single record over the budget can
                            // never be sent
                            return Err(Error::TruncatedPacket);
                        }
                        packets.push(packet.finish(true));
                        packet = PartialPacket::begin(&self.header, limit);
                        rr.serialise(&mut packet.buffer)?;
                        packet.count(section);
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        packets.push(packet.finish(false));
        Ok(packets)
    }
}

/// A packet under construction by `to_packets`: a buffer whose first
/// 12 octets are a header with zeroed counts, patched on `finish`.
struct PartialPacket {
    buffer: WritableBuffer,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

#[derive(Copy, Clone)]
enum Section {
    Answer,
    Authority,
    Additional,
}

impl PartialPacket {
    fn begin(header: &Header, limit: usize) -> Self {
        let mut buffer = WritableBuffer::with_limit(limit);
        header.serialise(&mut buffer);
        buffer.write_u16(0);
        buffer.write_u16(0);
        buffer.write_u16(0);
        buffer.write_u16(0);
        Self {
            buffer,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    fn count(&mut self, section: Section) {
        match section {
            Section::Answer => self.ancount += 1,
            Section::Authority => self.nscount += 1,
            Section::Additional => self.arcount += 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.qdcount == 0 && self.ancount == 0 && self.nscount == 0 && self.arcount == 0
    }

    fn finish(mut self, truncated: bool) -> BytesMut {
        self.buffer.set_u16_at(4, self.qdcount);
        self.buffer.set_u16_at(6, self.ancount);
        self.buffer.set_u16_at(8, self.nscount);
        self.buffer.set_u16_at(10, self.arcount);
        if truncated {
            self.buffer.or_u8_at(2, HEADER_MASK_TC);
        }
        self.buffer.octets
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question does not fit the buffer's size budget.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let checkpoint = buffer.checkpoint();

        self.name.serialise(buffer, true);
        buffer.write_u16(self.qtype.into());
        let qclass = u16::from(self.qclass)
            | if self.unicast_response {
                CLASS_MASK_UNIQUE
            } else {
                0
            };
        buffer.write_u16(qclass);

        if buffer.over_limit() {
            buffer.rollback(checkpoint);
            return Err(Error::TruncatedPacket);
        }
        Ok(())
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long, or the record does not fit the
    /// buffer's size budget.  In the latter case the buffer is left
    /// exactly as it was: no partial record is ever emitted.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let checkpoint = buffer.checkpoint();

        self.name.serialise(buffer, true);
        buffer.write_u16(self.data.rtype().into());
        let rclass = u16::from(self.rclass)
            | if self.cache_flush {
                CLASS_MASK_UNIQUE
            } else {
                0
            };
        buffer.write_u16(rclass);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.data {
            RecordData::A { address } => buffer.write_octets(&address.octets()),
            RecordData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordData::NS { nsdname } => nsdname.serialise(buffer, false),
            RecordData::CNAME { cname } => cname.serialise(buffer, false),
            RecordData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordData::PTR { ptrdname } => ptrdname.serialise(buffer, false),
            RecordData::HINFO { cpu, os } => {
                buffer.write_char_string(cpu);
                buffer.write_char_string(os);
            }
            RecordData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordData::TXT { strings } => {
                let mut octets = BytesMut::with_capacity(strings.serialised_len());
                strings.serialise_into(&mut octets);
                buffer.write_octets(&octets);
            }
            RecordData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = match usize_to_u16(buffer.index() - rdlength_index - 2) {
            Ok(len) => len,
            Err(err) => {
                buffer.rollback(checkpoint);
                return Err(err);
            }
        };
        buffer.set_u16_at(rdlength_index, rdlength);

        if buffer.over_limit() {
            buffer.rollback(checkpoint);
            return Err(Error::TruncatedPacket);
        }
        Ok(())
    }
}

impl DomainName {
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(ptr);
                return;
            }
        }

        buffer.memoise_name(self);
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },

    /// The message does not fit the packet size budget.  The write
    /// that failed has been rolled back.
    TruncatedPacket,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
            Error::TruncatedPacket => write!(f, "message does not fit the packet size budget"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes, with
/// a size budget and atomic rollback of over-budget writes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    limit: usize,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self::with_limit(PACKET_SIZE_MAX)
    }
}

impl WritableBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            limit: limit.min(PACKET_SIZE_MAX),
            name_pointers: HashMap::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn over_limit(&self) -> bool {
        self.octets.len() > self.limit
    }

    /// How many octets can still be written before `over_limit`.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.octets.len())
    }

    /// A position to `rollback` to.
    pub fn checkpoint(&self) -> usize {
        self.octets.len()
    }

    /// Discard everything written since `checkpoint`, including
    /// compression table entries pointing into the discarded region.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.octets.truncate(checkpoint);
        self.name_pointers
            .retain(|_, ptr| usize::from(*ptr & 0b0011_1111_1111_1111) < checkpoint);
    }

    pub fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root()
            && self.index() <= COMPRESSION_OFFSET_MAX
            && !self.name_pointers.contains_key(name)
        {
            // the offset check makes the cast safe
            let [hi, lo] = u16::try_from(self.index()).unwrap().to_be_bytes();
            self.name_pointers
                .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }

    /// Write a length-prefixed character-string, clamped to 255
    /// octets.
    pub fn write_char_string(&mut self, octets: &[u8]) {
        let len = octets.len().min(255);
        self.write_u8(len as u8);
        self.write_octets(&octets[..len]);
    }

    pub fn set_u16_at(&mut self, index: usize, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.octets[index] = hi;
        self.octets[index + 1] = lo;
    }

    pub fn or_u8_at(&mut self, index: usize, mask: u8) {
        self.octets[index] |= mask;
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    use std::net::Ipv4Addr;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_in() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                0b1100_0000, 0b0000_0100 // pointer
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength_and_flush_bit() {
        let mut buf = WritableBuffer::default();

        let mut rr = srv_record("a.local.", 8080, "b.local.");
        rr.cache_flush = true;
        rr.serialise(&mut buf).unwrap();

        assert_eq!(
            vec![
                // NAME
                1, 97, // "a"
                5, 108, 111, 99, 97, 108, 0, // "local"
                // TYPE
                0b0000_0000, 0b0010_0001, // SRV
                // CLASS: cache-flush | IN
                0b1000_0000, 0b0000_0001,
                // TTL
                0, 0, 0, 120,
                // RDLENGTH
                0, 15,
                // RDATA
                0, 0, // priority
                0, 0, // weight
                0b0001_1111, 0b1001_0000, // port 8080
                1, 98, // "b"
                5, 108, 111, 99, 97, 108, 0, // "local"
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_unicast_response_bit() {
        let mut buf = WritableBuffer::default();
        let mut question = Question::new(
            domain("foo.local."),
            QueryType::Record(RecordType::A),
        );
        question.unicast_response = true;
        question.serialise(&mut buf).unwrap();

        let qclass = u16::from_be_bytes([buf.octets[buf.octets.len() - 2], buf.octets[buf.octets.len() - 1]]);
        assert_eq!(0b1000_0000_0000_0001, qclass);
    }

    #[test]
    fn test_no_compression_pointers_past_offset_max() {
        let mut buf = WritableBuffer::default();
        // push the index past the largest encodable offset
        buf.write_octets(&vec![0; COMPRESSION_OFFSET_MAX + 1]);

        domain("www.example.com.").serialise(&mut buf, true);
        assert_eq!(None, buf.name_pointer(&domain("www.example.com.")));

        // a second write is therefore spelled out in full
        let before = buf.index();
        domain("www.example.com.").serialise(&mut buf, true);
        assert_eq!(before + 17, buf.index());
    }

    #[test]
    fn test_truncation_rolls_back_atomically() {
        // enough room for two small records but not the long one
        let mut buf = WritableBuffer::with_limit(60);
        let first = a_record("first.local.", Ipv4Addr::new(10, 0, 0, 1));
        let second = a_record("second-record-name.local.", Ipv4Addr::new(10, 0, 0, 2));

        assert_eq!(Ok(()), first.serialise(&mut buf));
        let len_after_first = buf.index();
        let pointers_after_first = buf.name_pointer(&domain("first.local.")).is_some();

        assert_eq!(Err(Error::TruncatedPacket), second.serialise(&mut buf));
        assert_eq!(len_after_first, buf.index());
        assert_eq!(
            pointers_after_first,
            buf.name_pointer(&domain("first.local.")).is_some()
        );
        assert_eq!(None, buf.name_pointer(&domain("second-record-name.local.")));

        // the buffer is still usable: a smaller record fits
        let third = a_record("x.local.", Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(Ok(()), third.serialise(&mut buf));
    }

    #[test]
    fn test_to_packets_splits_and_sets_tc() {
        let mut message = Message::response(0);
        for i in 0..40 {
            message.answers.push(a_record(
                &format!("host-{i}.example.local."),
                Ipv4Addr::new(10, 0, 0, 1),
            ));
        }

        let packets = message.to_packets(256).unwrap();
        assert!(packets.len() > 1);

        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.len() <= 256);
            let is_last = i == packets.len() - 1;
            let tc = packet[2] & HEADER_MASK_TC != 0;
            assert_eq!(!is_last, tc);
        }

        let total: u16 = packets
            .iter()
            .map(|p| u16::from_be_bytes([p[6], p[7]]))
            .sum();
        assert_eq!(40, total);
    }

    #[test]
    fn test_to_packets_single_oversized_record_fails() {
        let mut message = Message::response(0);
        message
            .answers
            .push(txt_record("big.local.", &[&[b'x'; 200]]));

        assert_eq!(Err(Error::TruncatedPacket), message.to_packets(64));
    }
}
