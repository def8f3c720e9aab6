//! TXT record data: an ordered sequence of octet strings, each at
//! most 255 bytes.  DNS-SD (RFC 6763 section 6) uses these for
//! `key=value` service metadata.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum length of a single string in a TXT record.
pub const TXT_STRING_MAX_LEN: usize = 255;

/// The ordered octet strings of a TXT record.
///
/// Two lists are equal exactly when their byte sequences are
/// identical, order included.  An empty list is valid and serialises
/// as a single zero-length string, since the wire format requires at
/// least one.
#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxtList {
    strings: Vec<Bytes>,
}

impl TxtList {
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bytes> {
        self.strings.iter()
    }

    /// Append an arbitrary octet string.
    ///
    /// # Errors
    ///
    /// If the string is longer than 255 octets.
    pub fn push(&mut self, string: Bytes) -> Result<(), TxtStringTooLong> {
        if string.len() > TXT_STRING_MAX_LEN {
            return Err(TxtStringTooLong {
                len: string.len(),
            });
        }
        self.strings.push(string);
        Ok(())
    }

    /// Append a `key=value` pair.
    ///
    /// # Errors
    ///
    /// If the combined string is longer than 255 octets.
    pub fn push_pair(&mut self, key: &str, value: &[u8]) -> Result<(), TxtStringTooLong> {
        let mut string = BytesMut::with_capacity(key.len() + 1 + value.len());
        string.put_slice(key.as_bytes());
        string.put_u8(b'=');
        string.put_slice(value);
        self.push(string.freeze())
    }

    /// Find the value for a `key=value` pair, comparing the key
    /// case-insensitively.  A string without `=` yields an empty
    /// value.
    pub fn lookup(&self, key: &str) -> Option<&[u8]> {
        for string in &self.strings {
            let (k, v) = match string.iter().position(|octet| *octet == b'=') {
                Some(idx) => (&string[..idx], &string[idx + 1..]),
                None => (&string[..], &string[string.len()..]),
            };
            if k.eq_ignore_ascii_case(key.as_bytes()) {
                return Some(v);
            }
        }
        None
    }

    /// Parse wire-format TXT data.  Total: a string whose declared
    /// length overruns the data is clamped to what is there.
    pub fn parse(mut octets: &[u8]) -> Self {
        let mut strings = Vec::new();
        while let Some((&size, rest)) = octets.split_first() {
            let take = (size as usize).min(rest.len());
            strings.push(Bytes::copy_from_slice(&rest[..take]));
            octets = &rest[take..];
        }
        Self { strings }
    }

    /// Write the wire form.  An empty list becomes a single
    /// zero-length string.
    pub fn serialise_into(&self, buf: &mut BytesMut) {
        if self.strings.is_empty() {
            buf.put_u8(0);
            return;
        }
        for string in &self.strings {
            // safe as `push` ensures a string is <= 255 bytes
            buf.put_u8(string.len().try_into().unwrap());
            buf.put_slice(string);
        }
    }

    /// The number of octets `serialise_into` will write.
    pub fn serialised_len(&self) -> usize {
        if self.strings.is_empty() {
            1
        } else {
            self.strings.len() + self.strings.iter().map(Bytes::len).sum::<usize>()
        }
    }
}

impl fmt::Display for TxtList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for string in &self.strings {
            if first {
                first = false;
            } else {
                write!(f, " ")?;
            }
            write!(f, "\"{}\"", String::from_utf8_lossy(string))?;
        }
        Ok(())
    }
}

impl FromIterator<Bytes> for TxtList {
    /// Collect strings, silently truncating any over 255 octets.
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut txt = TxtList::new();
        for string in iter {
            let clamped = string.slice(..string.len().min(TXT_STRING_MAX_LEN));
            txt.strings.push(clamped);
        }
        txt
    }
}

/// Error from pushing an over-long string.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TxtStringTooLong {
    pub len: usize,
}

impl fmt::Display for TxtStringTooLong {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TXT string of {} octets exceeds 255", self.len)
    }
}

impl std::error::Error for TxtStringTooLong {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for TxtList {
    // at least one string, as the wire format cannot distinguish an
    // empty list from a list of one empty string
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_strings = u.int_in_range::<usize>(1..=4)?;
        let mut txt = TxtList::new();
        for _ in 0..num_strings {
            let len = u.int_in_range::<usize>(0..=32)?;
            let octets = Bytes::copy_from_slice(u.bytes(len)?);
            txt.push(octets).unwrap();
        }
        Ok(txt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_strings() {
        let txt = TxtList::parse(b"\x04pa=1\x05txt=2");
        assert_eq!(2, txt.len());
        assert_eq!(Some(&b"1"[..]), txt.lookup("pa"));
        assert_eq!(Some(&b"2"[..]), txt.lookup("txt"));
    }

    #[test]
    fn parse_clamps_overrunning_string() {
        let txt = TxtList::parse(b"\x40oops");
        assert_eq!(1, txt.len());
        assert_eq!(&b"oops"[..], &txt.iter().next().unwrap()[..]);
    }

    #[test]
    fn serialise_parse_roundtrip() {
        let mut txt = TxtList::new();
        txt.push_pair("path", b"/printers").unwrap();
        txt.push(Bytes::from_static(b"flag")).unwrap();

        let mut buf = BytesMut::new();
        txt.serialise_into(&mut buf);
        assert_eq!(txt, TxtList::parse(&buf));
    }

    #[test]
    fn empty_list_serialises_as_single_empty_string() {
        let mut buf = BytesMut::new();
        TxtList::new().serialise_into(&mut buf);
        assert_eq!(&[0][..], &buf[..]);
        assert_eq!(1, TxtList::new().serialised_len());

        // and the wire form parses back to one empty string, which
        // is how the assertion "no TXT data" travels in DNS
        let parsed = TxtList::parse(&buf);
        assert_eq!(1, parsed.len());
        assert!(parsed.iter().next().unwrap().is_empty());
    }

    #[test]
    fn push_rejects_long_string() {
        let mut txt = TxtList::new();
        let long = Bytes::from(vec![b'x'; 256]);
        assert_eq!(Err(TxtStringTooLong { len: 256 }), txt.push(long));
    }

    #[test]
    fn lookup_is_case_insensitive_on_key_only() {
        let mut txt = TxtList::new();
        txt.push_pair("Path", b"/UPPER").unwrap();
        assert_eq!(Some(&b"/UPPER"[..]), txt.lookup("path"));
    }

    #[test]
    fn equality_is_order_sensitive() {
        let mut ab = TxtList::new();
        ab.push(Bytes::from_static(b"a")).unwrap();
        ab.push(Bytes::from_static(b"b")).unwrap();

        let mut ba = TxtList::new();
        ba.push(Bytes::from_static(b"b")).unwrap();
        ba.push(Bytes::from_static(b"a")).unwrap();

        assert_ne!(ab, ba);
    }
}
