//! # Bencode Codec
//!
//! This module implements the bencoded data format used by torrent files and
//! tracker responses.
//!
//! ## Format
//!
//! Bencode knows four shapes, each introduced by its first byte:
//!
//! - **Integer**: `i<decimal>e` (e.g. `i42e`)
//! - **Byte string**: `<length>:<raw bytes>` (e.g. `4:rust`)
//! - **List**: `l<values>e`
//! - **Dictionary**: `d<key-string><value>...e`
//!
//! ## Raw spans
//!
//! Every decoded value remembers the exact input slice it was parsed from.
//! The info-hash of a torrent is defined over the bytes of the `info`
//! dictionary as they appear in the file, so the loader hashes that captured
//! slice directly instead of re-encoding the tree.
//!
//! ## Canonical encoding
//!
//! Encoding emits dictionary keys in ascending byte-lexicographic order and
//! keeps every entry, including zero values. A decode/encode round trip of a
//! well-formed input whose keys were already sorted reproduces the input
//! exactly.
//!
//! ## Permissive integers
//!
//! Integer tokens are parsed as signed 64-bit first, then unsigned 64-bit,
//! then 64-bit float. Real-world trackers emit values outside the signed
//! range and occasionally outside strict bencode altogether; a float decodes
//! but refuses to re-encode.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while decoding or encoding bencoded data.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A byte that cannot start or continue a value at this position.
    #[error("invalid character {0:#04x} in bencoded data")]
    InvalidCharacter(u8),
    /// A string length that is negative or does not fit in memory.
    #[error("invalid string length in bencoded data")]
    InvalidLength,
    /// An integer body that parses neither as integer nor as float.
    #[error("invalid integer in bencoded data")]
    InvalidInteger,
    /// The input ended in the middle of a value.
    #[error("unexpected end of bencoded data")]
    UnexpectedEof,
    /// Floats are a decode-only extension and cannot be re-encoded.
    #[error("cannot encode a float value")]
    UnencodableFloat,
}

/// A decoded bencode value together with the raw input slice it came from.
#[derive(Clone)]
pub struct Value<'a> {
    /// Exact bytes of the input this value was decoded from.
    pub bytes: &'a [u8],
    /// The decoded content.
    pub data: ValueData<'a>,
}

/// The content of a bencode value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData<'a> {
    /// Signed 64-bit integer.
    Integer(i64),
    /// Unsigned 64-bit integer; only produced when the token exceeds the
    /// signed range.
    Unsigned(u64),
    /// Float fallback for tokens that are not integral.
    Float(f64),
    /// Byte string, not necessarily UTF-8.
    Bytes(&'a [u8]),
    /// Ordered sequence of values.
    List(Vec<Value<'a>>),
    /// Dictionary with byte-string keys.
    Dict(Dict<'a>),
}

impl<'a> std::fmt::Debug for Value<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <ValueData<'a> as std::fmt::Debug>::fmt(&self.data, f)
    }
}

impl<'a> PartialEq for Value<'a> {
    fn eq(&self, other: &Self) -> bool {
        // Two values are equal when their content is; the spans they were
        // decoded from do not matter.
        self.data == other.data
    }
}

impl<'a> Value<'a> {
    /// Returns the signed integer content, if any.
    pub fn as_integer(&self) -> Option<i64> {
        match self.data {
            ValueData::Integer(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the integer content widened to `u64`, rejecting negatives.
    pub fn as_u64(&self) -> Option<u64> {
        match self.data {
            ValueData::Integer(v) => u64::try_from(v).ok(),
            ValueData::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the byte-string content, if any.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.data {
            ValueData::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the byte-string content as UTF-8, if both hold.
    pub fn as_str(&self) -> Option<&'a str> {
        match self.data {
            ValueData::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }

    /// Returns the list content, if any.
    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match &self.data {
            ValueData::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Returns the dictionary content, if any.
    pub fn as_dict(&self) -> Option<&Dict<'a>> {
        match &self.data {
            ValueData::Dict(v) => Some(v),
            _ => None,
        }
    }

    /// Canonically encode this value.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DictEntry<'a> {
    key: &'a [u8],
    value: Value<'a>,
}

/// A bencode dictionary.
///
/// Entries keep the order they had in the input; lookups are linear, which is
/// fine for the handful of keys a torrent or tracker response carries.
/// Encoding sorts keys, see [`encode`].
#[derive(Clone, PartialEq)]
pub struct Dict<'a> {
    entries: Vec<DictEntry<'a>>,
}

impl<'a> std::fmt::Debug for Dict<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut m = f.debug_map();
        for entry in &self.entries {
            match std::str::from_utf8(entry.key) {
                Ok(key) => m.key(&key),
                Err(_) => m.key(&entry.key),
            };
            m.value(&entry.value);
        }
        m.finish()
    }
}

impl<'a> Dict<'a> {
    /// Look up an entry by raw key bytes.
    pub fn find(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.value)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode a complete bencoded document.
///
/// The whole input must be consumed; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let mut parser = Parser::new(buf);
    let value = parser.parse_value()?;

    // A torrent file or tracker response is exactly one value
    if parser.offset < buf.len() {
        return Err(Error::InvalidCharacter(buf[parser.offset]));
    }

    Ok(value)
}

/// Canonically encode a value tree.
///
/// Integers become `i<decimal>e`, strings `<len>:<bytes>`, lists `l...e` and
/// dictionaries `d...e` with keys in ascending byte order. Every dictionary
/// entry is emitted, zero values included: the bytes produced for a given
/// tree are deterministic.
pub fn encode(data: &ValueData) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = vec![];
    encode_into(data, &mut buf)?;
    Ok(buf)
}

fn encode_into(data: &ValueData, buf: &mut Vec<u8>) -> Result<()> {
    match data {
        ValueData::Integer(v) => {
            buf.push(b'i');
            buf.extend_from_slice(v.to_string().as_bytes());
            buf.push(b'e');
        }
        ValueData::Unsigned(v) => {
            buf.push(b'i');
            buf.extend_from_slice(v.to_string().as_bytes());
            buf.push(b'e');
        }
        ValueData::Float(_) => return Err(Error::UnencodableFloat),
        ValueData::Bytes(v) => encode_string(v, buf),
        ValueData::List(values) => {
            buf.push(b'l');
            for value in values {
                encode_into(&value.data, buf)?;
            }
            buf.push(b'e');
        }
        ValueData::Dict(dict) => {
            buf.push(b'd');

            // Canonical form sorts keys by raw bytes
            let mut entries: Vec<&DictEntry> = dict.entries.iter().collect();
            entries.sort_unstable_by(|a, b| a.key.cmp(b.key));

            for entry in entries {
                encode_string(entry.key, buf);
                encode_into(&entry.value.data, buf)?;
            }
            buf.push(b'e');
        }
    }

    Ok(())
}

fn encode_string(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

struct Parser<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Parser<'a> {
        Parser { data, offset: 0 }
    }

    fn parse_value(&mut self) -> Result<Value<'a>> {
        let start = self.offset;

        let data = match self.peek_one()? {
            b'i' => self.parse_integer()?,
            b'0'..=b'9' => self.parse_string()?,
            b'l' => self.parse_list()?,
            b'd' => self.parse_dict()?,
            other => return Err(Error::InvalidCharacter(other)),
        };

        Ok(Value {
            bytes: &self.data[start..self.offset],
            data,
        })
    }

    fn parse_integer(&mut self) -> Result<ValueData<'a>> {
        self.expect_one(b'i')?;
        let body = self.consume_until(b'e')?;
        let body = std::str::from_utf8(body).map_err(|_| Error::InvalidInteger)?;

        // Greedy fallback chain: signed, then unsigned, then float
        if let Ok(signed) = body.parse::<i64>() {
            return Ok(ValueData::Integer(signed));
        }
        if let Ok(unsigned) = body.parse::<u64>() {
            return Ok(ValueData::Unsigned(unsigned));
        }
        if !body.is_empty() {
            if let Ok(float) = body.parse::<f64>() {
                return Ok(ValueData::Float(float));
            }
        }

        Err(Error::InvalidInteger)
    }

    fn parse_string(&mut self) -> Result<ValueData<'a>> {
        let digits = self.consume_until(b':')?;
        let digits = std::str::from_utf8(digits).map_err(|_| Error::InvalidLength)?;

        // Lengths are 64-bit on the wire but must fit a byte count
        let length = digits.parse::<i64>().map_err(|_| Error::InvalidLength)?;
        if length < 0 {
            return Err(Error::InvalidLength);
        }
        let length: usize = length.try_into().map_err(|_| Error::InvalidLength)?;

        let bytes = self.consume_n(length)?;
        Ok(ValueData::Bytes(bytes))
    }

    fn parse_list(&mut self) -> Result<ValueData<'a>> {
        self.expect_one(b'l')?;

        let mut values: Vec<Value<'a>> = vec![];
        while self.peek_one()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.expect_one(b'e')?;

        Ok(ValueData::List(values))
    }

    fn parse_dict(&mut self) -> Result<ValueData<'a>> {
        self.expect_one(b'd')?;

        let mut entries: Vec<DictEntry<'a>> = vec![];
        while self.peek_one()? != b'e' {
            // Keys are byte strings
            let key = match self.peek_one()? {
                b'0'..=b'9' => match self.parse_string()? {
                    ValueData::Bytes(key) => key,
                    _ => unreachable!(),
                },
                other => return Err(Error::InvalidCharacter(other)),
            };
            let value = self.parse_value()?;
            entries.push(DictEntry { key, value });
        }
        self.expect_one(b'e')?;

        Ok(ValueData::Dict(Dict { entries }))
    }

    fn peek_one(&self) -> Result<u8> {
        self.data
            .get(self.offset)
            .copied()
            .ok_or(Error::UnexpectedEof)
    }

    fn expect_one(&mut self, expected: u8) -> Result<()> {
        let got = self.peek_one()?;
        if got != expected {
            return Err(Error::InvalidCharacter(got));
        }
        self.offset += 1;
        Ok(())
    }

    fn consume_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        let start = self.offset;
        while let Some(&byte) = self.data.get(self.offset) {
            if byte == delim {
                let body = &self.data[start..self.offset];
                self.offset += 1;
                return Ok(body);
            }
            self.offset += 1;
        }
        Err(Error::UnexpectedEof)
    }

    fn consume_n(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset.saturating_add(n) > self.data.len() {
            return Err(Error::UnexpectedEof);
        }
        let bytes = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        let value = decode(b"i42e").unwrap();
        assert_eq!(value.as_integer().unwrap(), 42);

        let value = decode(b"i-123e").unwrap();
        assert_eq!(value.as_integer().unwrap(), -123);

        let value = decode(b"i0e").unwrap();
        assert_eq!(value.as_integer().unwrap(), 0);

        assert_eq!(decode(b"ie").unwrap_err(), Error::InvalidInteger);
        assert_eq!(decode(b"i12x3e").unwrap_err(), Error::InvalidInteger);
        assert_eq!(decode(b"i123").unwrap_err(), Error::UnexpectedEof);
    }

    #[test]
    fn test_decode_integer_fallback_chain() {
        // One past i64::MAX falls back to unsigned
        let value = decode(b"i9223372036854775808e").unwrap();
        assert_eq!(value.data, ValueData::Unsigned(9223372036854775808));

        // In signed range, stays signed
        let value = decode(b"i9223372036854775807e").unwrap();
        assert_eq!(value.as_integer().unwrap(), i64::MAX);

        // Not integral at all falls back to float
        let value = decode(b"i3.14e").unwrap();
        assert_eq!(value.data, ValueData::Float(3.14));
    }

    #[test]
    fn test_decode_strings() {
        let value = decode(b"4:rust").unwrap();
        assert_eq!(value.as_str().unwrap(), "rust");

        let value = decode(b"0:").unwrap();
        assert_eq!(value.as_bytes().unwrap(), b"");

        assert_eq!(decode(b"4:r").unwrap_err(), Error::UnexpectedEof);
        assert!(matches!(
            decode(b"-1:abc").unwrap_err(),
            Error::InvalidCharacter(b'-')
        ));
    }

    #[test]
    fn test_decode_non_utf8_string() {
        let value = decode(b"3:\xc0\xa8\x01").unwrap();
        assert_eq!(value.as_bytes().unwrap(), &[0xc0, 0xa8, 0x01]);
        assert!(value.as_str().is_none());
    }

    #[test]
    fn test_decode_lists() {
        let value = decode(b"li42e4:ruste").unwrap();
        let list = value.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_integer().unwrap(), 42);
        assert_eq!(list[1].as_str().unwrap(), "rust");

        let value = decode(b"le").unwrap();
        assert!(value.as_list().unwrap().is_empty());

        assert_eq!(decode(b"li42e").unwrap_err(), Error::UnexpectedEof);
    }

    #[test]
    fn test_decode_dicts() {
        let value = decode(b"d3:keyi42e5:value3:abce").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.find(b"key").unwrap().as_integer().unwrap(), 42);
        assert_eq!(dict.find(b"value").unwrap().as_str().unwrap(), "abc");
        assert!(dict.find(b"missing").is_none());

        let value = decode(b"de").unwrap();
        assert!(value.as_dict().unwrap().is_empty());

        assert_eq!(decode(b"d3:keyi42e").unwrap_err(), Error::UnexpectedEof);
        // Keys must be byte strings
        assert!(matches!(
            decode(b"di1ei2ee").unwrap_err(),
            Error::InvalidCharacter(b'i')
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        assert!(matches!(
            decode(b"i42egarbage").unwrap_err(),
            Error::InvalidCharacter(b'g')
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_leading_byte() {
        assert!(matches!(
            decode(b"z").unwrap_err(),
            Error::InvalidCharacter(b'z')
        ));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        // Construct a tree with sorted dictionary keys, encode it, decode the
        // bytes and compare content
        let original = decode(b"d1:ai0e1:b0:1:cl3:fooi-7ee1:dd2:aai1eee").unwrap();
        let encoded = original.encode().unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_constructed_value() {
        // A tree built by hand (keys already sorted) survives an
        // encode/decode round trip
        let span: &[u8] = b"";
        let tree = ValueData::Dict(Dict {
            entries: vec![
                DictEntry {
                    key: b"count",
                    value: Value {
                        bytes: span,
                        data: ValueData::Integer(3),
                    },
                },
                DictEntry {
                    key: b"items",
                    value: Value {
                        bytes: span,
                        data: ValueData::List(vec![
                            Value {
                                bytes: span,
                                data: ValueData::Bytes(b"foo"),
                            },
                            Value {
                                bytes: span,
                                data: ValueData::Integer(-1),
                            },
                        ]),
                    },
                },
            ],
        });

        let encoded = encode(&tree).unwrap();
        assert_eq!(encoded, b"d5:counti3e5:itemsl3:fooi-1eee");
        assert_eq!(decode(&encoded).unwrap().data, tree);
    }

    #[test]
    fn test_decode_encode_reproduces_sorted_input() {
        // A well-formed document with sorted keys re-encodes byte-exact,
        // zero values included
        let inputs: [&[u8]; 4] = [
            b"d1:ai0e1:b0:1:clee",
            b"d8:announce4:http4:infod6:lengthi0eee",
            b"li1ei2ei3ee",
            b"i-42e",
        ];
        for input in inputs {
            let value = decode(input).unwrap();
            assert_eq!(value.encode().unwrap(), input);
        }
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        // Input keys out of order; canonical encoding reorders them
        let value = decode(b"d1:bi1e1:ai2ee").unwrap();
        assert_eq!(value.encode().unwrap(), b"d1:ai2e1:bi1ee");
    }

    #[test]
    fn test_encode_unsigned() {
        let value = decode(b"i18446744073709551615e").unwrap();
        assert_eq!(value.data, ValueData::Unsigned(u64::MAX));
        assert_eq!(value.encode().unwrap(), b"i18446744073709551615e");
    }

    #[test]
    fn test_encode_float_fails() {
        let value = decode(b"i2.5e").unwrap();
        assert_eq!(value.encode().unwrap_err(), Error::UnencodableFloat);
    }

    #[test]
    fn test_values_capture_raw_spans() {
        let input: &[u8] = b"d8:announce4:http4:infod6:lengthi42e4:name3:abcee";
        let value = decode(input).unwrap();
        let info = value.as_dict().unwrap().find(b"info").unwrap();

        // The captured slice is the exact sub-document, suitable for hashing
        assert_eq!(info.bytes, &b"d6:lengthi42e4:name3:abce"[..]);
        assert_eq!(info.as_dict().unwrap().find(b"length").unwrap().bytes, b"i42e");
    }

    #[test]
    fn test_as_u64_narrowing() {
        assert_eq!(decode(b"i42e").unwrap().as_u64().unwrap(), 42);
        assert_eq!(
            decode(b"i9223372036854775808e").unwrap().as_u64().unwrap(),
            9223372036854775808
        );
        assert!(decode(b"i-1e").unwrap().as_u64().is_none());
        assert!(decode(b"3:abc").unwrap().as_u64().is_none());
    }
}
