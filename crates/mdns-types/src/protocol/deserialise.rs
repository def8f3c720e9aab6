//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;
use crate::txt::TxtList;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// Parse as much of the message as is well-formed.  A malformed
    /// question or record ends its section and drops everything after
    /// it, but what parsed before it is kept: a responder answers the
    /// questions it could read.
    ///
    /// # Errors
    ///
    /// Only if the header itself cannot be parsed.
    pub fn from_octets_lenient(octets: &[u8]) -> Result<Self, Error> {
        let mut buffer = ConsumableBuffer::new(octets);
        let wire_header = WireHeader::deserialise(&mut buffer)?;

        let mut message = Self {
            header: wire_header.header,
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };

        for _ in 0..wire_header.qdcount {
            match Question::deserialise(&mut buffer) {
                Ok(question) => message.questions.push(question),
                Err(_) => return Ok(message),
            }
        }
        for _ in 0..wire_header.ancount {
            match ResourceRecord::deserialise(&mut buffer) {
                Ok(rr) => message.answers.push(rr),
                Err(_) => return Ok(message),
            }
        }
        for _ in 0..wire_header.nscount {
            match ResourceRecord::deserialise(&mut buffer) {
                Ok(rr) => message.authority.push(rr),
                Err(_) => return Ok(message),
            }
        }
        for _ in 0..wire_header.arcount {
            match ResourceRecord::deserialise(&mut buffer) {
                Ok(rr) => message.additional.push(rr),
                Err(_) => return Ok(message),
            }
        }

        Ok(message)
    }

    /// Like `from_octets`, but additionally rejects records of types
    /// this implementation does not interpret.
    ///
    /// # Errors
    ///
    /// If the message cannot be parsed, or contains an unknown record
    /// type.
    pub fn from_octets_strict(octets: &[u8]) -> Result<Self, Error> {
        let message = Self::from_octets(octets)?;
        for rr in message
            .answers
            .iter()
            .chain(message.authority.iter())
            .chain(message.additional.iter())
        {
            if let RecordData::Unknown { tag, .. } = &rr.data {
                return Err(Error::UnsupportedRRType(RecordType::Unknown(*tag).into()));
            }
        }
        Ok(message)
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

/// The header as it appears on the wire: the `Header` fields plus the
/// section counts.
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::MalformedHeader)?;
        let flags1 = buffer.next_u8().ok_or(Error::MalformedHeader)?;
        let flags2 = buffer.next_u8().ok_or(Error::MalformedHeader)?;
        let qdcount = buffer.next_u16().ok_or(Error::MalformedHeader)?;
        let ancount = buffer.next_u16().ok_or(Error::MalformedHeader)?;
        let nscount = buffer.next_u16().ok_or(Error::MalformedHeader)?;
        let arcount = buffer.next_u16().ok_or(Error::MalformedHeader)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from(flags2 & HEADER_MASK_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let qtype = buffer.next_u16().ok_or(Error::TruncatedPacket)?.into();
        let qclass_raw = buffer.next_u16().ok_or(Error::TruncatedPacket)?;

        Ok(Self {
            name,
            qtype,
            qclass: QueryClass::from(qclass_raw & !CLASS_MASK_UNIQUE),
            unicast_response: qclass_raw & CLASS_MASK_UNIQUE != 0,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(buffer)?;
        let rtype = RecordType::from(buffer.next_u16().ok_or(Error::TruncatedPacket)?);
        let rclass_raw = buffer.next_u16().ok_or(Error::TruncatedPacket)?;
        let ttl = buffer.next_u32().ok_or(Error::TruncatedPacket)?;
        let rdlength = buffer.next_u16().ok_or(Error::TruncatedPacket)?;

        let rdata_start = buffer.position;

        let mut raw_rdata = || {
            if let Some(octets) = buffer.take(rdlength as usize) {
                Ok(Bytes::copy_from_slice(octets))
            } else {
                Err(Error::TruncatedPacket)
            }
        };

        // for records which include domain names, deserialise them to
        // expand pointers.
        let data = match rtype {
            RecordType::A => RecordData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or(Error::TruncatedPacket)?),
            },
            RecordType::AAAA => {
                let mut octets = [0; 16];
                if let Some(taken) = buffer.take(16) {
                    octets.copy_from_slice(taken);
                } else {
                    return Err(Error::TruncatedPacket);
                }
                RecordData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
            RecordType::NS => RecordData::NS {
                nsdname: DomainName::deserialise(buffer)?,
            },
            RecordType::CNAME => RecordData::CNAME {
                cname: DomainName::deserialise(buffer)?,
            },
            RecordType::SOA => RecordData::SOA {
                mname: DomainName::deserialise(buffer)?,
                rname: DomainName::deserialise(buffer)?,
                serial: buffer.next_u32().ok_or(Error::TruncatedPacket)?,
                refresh: buffer.next_u32().ok_or(Error::TruncatedPacket)?,
                retry: buffer.next_u32().ok_or(Error::TruncatedPacket)?,
                expire: buffer.next_u32().ok_or(Error::TruncatedPacket)?,
                minimum: buffer.next_u32().ok_or(Error::TruncatedPacket)?,
            },
            RecordType::PTR => RecordData::PTR {
                ptrdname: DomainName::deserialise(buffer)?,
            },
            RecordType::HINFO => RecordData::HINFO {
                cpu: buffer.take_char_string().ok_or(Error::TruncatedPacket)?,
                os: buffer.take_char_string().ok_or(Error::TruncatedPacket)?,
            },
            RecordType::MX => RecordData::MX {
                preference: buffer.next_u16().ok_or(Error::TruncatedPacket)?,
                exchange: DomainName::deserialise(buffer)?,
            },
            RecordType::TXT => RecordData::TXT {
                strings: TxtList::parse(&raw_rdata()?),
            },
            RecordType::SRV => RecordData::SRV {
                priority: buffer.next_u16().ok_or(Error::TruncatedPacket)?,
                weight: buffer.next_u16().ok_or(Error::TruncatedPacket)?,
                port: buffer.next_u16().ok_or(Error::TruncatedPacket)?,
                target: DomainName::deserialise(buffer)?,
            },
            RecordType::Unknown(tag) => RecordData::Unknown {
                tag,
                octets: raw_rdata()?,
            },
        };

        let rdata_stop = buffer.position;

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                data,
                rclass: RecordClass::from(rclass_raw & !CLASS_MASK_UNIQUE),
                cache_flush: rclass_raw & CLASS_MASK_UNIQUE != 0,
                ttl,
            })
        } else {
            // the RDATA did not line up with its declared length: the
            // packet is mangled and cannot be trusted
            Err(Error::TruncatedPacket)
        }
    }
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    #[allow(clippy::missing_panics_doc)]
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut len = 0;
        let mut labels = Vec::<Label>::with_capacity(5);
        let start = buffer.position;

        'outer: loop {
            let size = buffer.next_u8().ok_or(Error::TruncatedPacket)?;

            if usize::from(size) <= LABEL_MAX_LEN {
                len += 1;

                if size == 0 {
                    labels.push(Label::new());
                    break 'outer;
                }

                if let Some(os) = buffer.take(size as usize) {
                    // safe because of the bounds check above
                    let label = Label::try_from(os).unwrap();
                    len += usize::from(label.len());
                    labels.push(label);
                } else {
                    return Err(Error::TruncatedPacket);
                }

                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::MalformedName);
                }
            } else if size >= 192 {
                // this requires re-parsing the pointed-to domain -
                // not great but works for now.
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::TruncatedPacket)?;
                let ptr = u16::from_be_bytes([hi, lo]).into();

                // a pointer must be to an earlier offset (not merely
                // a different one: an earlier one, RFC 1035 section
                // 4.1.4) - this is what makes pointer chains loop-free
                if ptr >= start {
                    return Err(Error::CompressionLoop);
                }

                let mut other = DomainName::deserialise(&mut buffer.at_offset(ptr))?;
                len += other.len;
                labels.append(&mut other.labels);
                break 'outer;
            } else {
                return Err(Error::MalformedName);
            }
        }

        if len <= DOMAINNAME_MAX_LEN {
            Ok(DomainName { labels, len })
        } else {
            Err(Error::MalformedName)
        }
    }
}

/// Errors encountered when parsing a datagram.  mDNS never answers a
/// malformed packet, so unlike unicast DNS there is no id to carry
/// around for an error response: the packet is logged and dropped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The 12-octet header is incomplete.
    MalformedHeader,

    /// The packet ends in the middle of a field, or a record's RDATA
    /// does not line up with its declared length.
    TruncatedPacket,

    /// A label is longer than 63 octets, or a name longer than 255.
    MalformedName,

    /// A compression pointer does not point strictly backwards.
    CompressionLoop,

    /// Strict decoding only: a record type this implementation does
    /// not interpret.
    UnsupportedRRType(u16),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::MalformedHeader => write!(f, "malformed header"),
            Error::TruncatedPacket => write!(f, "packet is truncated"),
            Error::MalformedName => write!(f, "malformed domain name"),
            Error::CompressionLoop => write!(f, "compression pointer loop"),
            Error::UnsupportedRRType(tag) => write!(f, "unsupported record type {tag}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    /// Take a length-prefixed character-string.
    pub fn take_char_string(&mut self) -> Option<Bytes> {
        let len = self.next_u8()?;
        self.take(len as usize).map(Bytes::copy_from_slice)
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::serialise::WritableBuffer;
    use crate::protocol::types::test_util::*;

    #[test]
    fn roundtrip_resourcerecord() {
        for _ in 0..100 {
            let original = arbitrary_resourcerecord();

            let mut buffer = WritableBuffer::default();
            original.serialise(&mut buffer).unwrap();
            let deserialised = ResourceRecord::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

            assert_eq!(Ok(original), deserialised);
        }
    }

    #[test]
    fn roundtrip_message() {
        for _ in 0..20 {
            let mut original = Message::response(0);
            original.questions.push(Question::new(
                domain("query.local."),
                QueryType::Wildcard,
            ));
            for _ in 0..4 {
                original.answers.push(arbitrary_resourcerecord());
                original.additional.push(arbitrary_resourcerecord());
            }
            // repeated names exercise compression on the way out and
            // pointer expansion on the way back
            original.answers.push(ptr_record("query.local.", "target.local."));
            original.answers.push(ptr_record("query.local.", "other.local."));

            let deserialised = Message::from_octets(&original.to_octets().unwrap());
            assert_eq!(Ok(original), deserialised);
        }
    }

    #[test]
    fn roundtrip_domainname() {
        for _ in 0..100 {
            let original = arbitrary_resourcerecord().name;

            let mut buffer = WritableBuffer::default();
            original.serialise(&mut buffer, true);
            let deserialised = DomainName::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

            assert_eq!(Ok(original), deserialised);
        }
    }

    #[test]
    fn deserialise_rejects_forward_pointer() {
        // header + one question whose name is a pointer to itself
        let mut octets = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        octets.extend_from_slice(&[0b1100_0000, 12, 0, 1, 0, 1]);

        assert_eq!(Err(Error::CompressionLoop), Message::from_octets(&octets));
    }

    #[test]
    fn deserialise_rejects_overlong_label() {
        // a label length in the forbidden 64..191 range
        let mut octets = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        octets.push(70);
        octets.extend_from_slice(&[b'x'; 70]);
        octets.extend_from_slice(&[0, 0, 1, 0, 1]);

        assert_eq!(Err(Error::MalformedName), Message::from_octets(&octets));
    }

    #[test]
    fn deserialise_rejects_overlong_name() {
        // chained 63-octet labels exceeding 255 total
        let mut octets = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        for _ in 0..5 {
            octets.push(63);
            octets.extend_from_slice(&[b'x'; 63]);
        }
        octets.extend_from_slice(&[0, 0, 1, 0, 1]);

        assert_eq!(Err(Error::MalformedName), Message::from_octets(&octets));
    }

    #[test]
    fn deserialise_rejects_short_packet() {
        assert_eq!(
            Err(Error::MalformedHeader),
            Message::from_octets(&[0, 0, 0])
        );
    }

    #[test]
    fn lenient_parse_keeps_prefix() {
        // one good question followed by garbage claiming to be a
        // second question
        let mut message = Message::query();
        message.questions.push(Question::new(
            domain("printer.local."),
            QueryType::Record(RecordType::A),
        ));
        let mut octets = message.to_octets().unwrap().to_vec();
        // claim two questions but only provide one
        octets[5] = 2;

        let parsed = Message::from_octets_lenient(&octets).unwrap();
        assert_eq!(1, parsed.questions.len());
        assert_eq!(domain("printer.local."), parsed.questions[0].name);
    }

    #[test]
    fn strict_parse_rejects_unknown_types() {
        let mut message = Message::response(0);
        message.answers.push(ResourceRecord {
            name: domain("foo.local."),
            data: RecordData::Unknown {
                tag: match RecordType::from(999) {
                    RecordType::Unknown(tag) => tag,
                    _ => unreachable!(),
                },
                octets: Bytes::from_static(b"xyz"),
            },
            rclass: RecordClass::IN,
            cache_flush: false,
            ttl: 120,
        });
        let octets = message.to_octets().unwrap();

        assert!(Message::from_octets(&octets).is_ok());
        assert_eq!(
            Err(Error::UnsupportedRRType(999)),
            Message::from_octets_strict(&octets)
        );
    }

    #[test]
    fn unicast_response_and_cache_flush_bits_decode() {
        let mut message = Message::query();
        let mut question = Question::new(
            domain("foo.local."),
            QueryType::Record(RecordType::PTR),
        );
        question.unicast_response = true;
        message.questions.push(question);
        let mut answer = ptr_record("foo.local.", "bar.local.");
        answer.cache_flush = true;
        message.answers.push(answer);

        let parsed = Message::from_octets(&message.to_octets().unwrap()).unwrap();
        assert!(parsed.questions[0].unicast_response);
        assert_eq!(
            QueryClass::Record(RecordClass::IN),
            parsed.questions[0].qclass
        );
        assert!(parsed.answers[0].cache_flush);
        assert_eq!(RecordClass::IN, parsed.answers[0].rclass);
    }
}
