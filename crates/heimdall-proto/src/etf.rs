//! Binary term format used by the gateway's `etf` encoding.
//!
//! Values are modelled as [`serde_json::Value`] so decoded frames can be
//! handed downstream as opaque structured records. The mapping is lossy only
//! where the term format is richer than JSON: atoms and binaries both become
//! strings, tuples become arrays, and integers too wide for 64 bits become
//! their decimal string.

use std::io::Read;

use flate2::read::ZlibDecoder;
use serde_json::{Map, Number, Value};

use crate::error::ProtoError;

/// Leading byte of every encoded term.
pub const FORMAT_VERSION: u8 = 131;

const MAX_DEPTH: usize = 128;

const NEW_FLOAT_EXT: u8 = 70;
const COMPRESSED: u8 = 80;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Encode a value as a versioned term.
///
/// # Errors
///
/// Returns an error if the value is nested deeper than the codec allows or
/// a collection is too large for a 32-bit length prefix.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    encode_term(value, &mut out, 0)?;
    Ok(out)
}

/// Decode a versioned term.
///
/// # Errors
///
/// Returns an error on a bad version byte, truncated input, unknown tags,
/// trailing garbage, or a corrupt compressed term.
pub fn from_bytes(bytes: &[u8]) -> Result<Value, ProtoError> {
    let mut reader = Reader::new(bytes);
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(ProtoError::UnsupportedVersion(version));
    }
    let value = reader.term(0)?;
    if reader.remaining() != 0 {
        return Err(ProtoError::Decoding(format!(
            "{} trailing bytes after term",
            reader.remaining()
        )));
    }
    Ok(value)
}

fn encode_term(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<(), ProtoError> {
    if depth > MAX_DEPTH {
        return Err(ProtoError::Encoding("value nested too deeply".to_string()));
    }

    match value {
        Value::Null => encode_atom("nil", out),
        Value::Bool(flag) => encode_atom(if *flag { "true" } else { "false" }, out),
        Value::Number(number) => encode_number(number, out)?,
        Value::String(text) => encode_binary(text.as_bytes(), out)?,
        Value::Array(items) if items.is_empty() => out.push(NIL_EXT),
        Value::Array(items) => {
            out.push(LIST_EXT);
            out.extend_from_slice(&length_prefix(items.len())?.to_be_bytes());
            for item in items {
                encode_term(item, out, depth + 1)?;
            }
            out.push(NIL_EXT);
        }
        Value::Object(map) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&length_prefix(map.len())?.to_be_bytes());
            for (key, item) in map {
                encode_binary(key.as_bytes(), out)?;
                encode_term(item, out, depth + 1)?;
            }
        }
    }
    Ok(())
}

// Only called with the short literal atom names above.
fn encode_atom(name: &str, out: &mut Vec<u8>) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn encode_binary(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), ProtoError> {
    out.push(BINARY_EXT);
    out.extend_from_slice(&length_prefix(bytes.len())?.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode_number(number: &Number, out: &mut Vec<u8>) -> Result<(), ProtoError> {
    if let Some(unsigned) = number.as_u64() {
        if let Ok(small) = u8::try_from(unsigned) {
            out.push(SMALL_INTEGER_EXT);
            out.push(small);
        } else if let Ok(int) = i32::try_from(unsigned) {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&int.to_be_bytes());
        } else {
            encode_small_big(false, unsigned, out);
        }
    } else if let Some(signed) = number.as_i64() {
        if let Ok(int) = i32::try_from(signed) {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&int.to_be_bytes());
        } else {
            encode_small_big(true, signed.unsigned_abs(), out);
        }
    } else if let Some(float) = number.as_f64() {
        out.push(NEW_FLOAT_EXT);
        out.extend_from_slice(&float.to_be_bytes());
    } else {
        return Err(ProtoError::Encoding(format!("unrepresentable number {number}")));
    }
    Ok(())
}

fn encode_small_big(negative: bool, magnitude: u64, out: &mut Vec<u8>) {
    let digits = magnitude.to_le_bytes();
    let len = digits.iter().rposition(|&d| d != 0).map_or(1, |last| last + 1);
    out.push(SMALL_BIG_EXT);
    out.push(len as u8);
    out.push(u8::from(negative));
    out.extend_from_slice(&digits[..len]);
}

fn length_prefix(len: usize) -> Result<u32, ProtoError> {
    u32::try_from(len).map_err(|_| ProtoError::Encoding(format!("length {len} exceeds u32")))
}

fn atom_value(name: String) -> Value {
    match name.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name),
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => latin1(bytes),
    }
}

fn map_key(key: Value) -> String {
    match key {
        Value::String(s) => s,
        Value::Null => "nil".to_string(),
        other => other.to_string(),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ProtoError::UnexpectedEof(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<usize, ProtoError> {
        Ok(usize::from(u16::from_be_bytes(self.array()?)))
    }

    fn u32(&mut self) -> Result<usize, ProtoError> {
        Ok(u32::from_be_bytes(self.array()?) as usize)
    }

    fn term(&mut self, depth: usize) -> Result<Value, ProtoError> {
        if depth > MAX_DEPTH {
            return Err(ProtoError::Decoding("term nested too deeply".to_string()));
        }

        let offset = self.pos;
        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => Ok(Value::from(i32::from_be_bytes(self.array()?))),
            NEW_FLOAT_EXT => Ok(Value::from(f64::from_be_bytes(self.array()?))),
            FLOAT_EXT => {
                let raw = self.take(31)?;
                let repr = latin1(raw);
                repr.trim_end_matches('\0')
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|e| ProtoError::Decoding(format!("bad float {repr:?}: {e}")))
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()?;
                Ok(atom_value(text(self.take(len)?)))
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = usize::from(self.u8()?);
                Ok(atom_value(text(self.take(len)?)))
            }
            SMALL_TUPLE_EXT => {
                let arity = usize::from(self.u8()?);
                self.sequence(arity, depth).map(Value::Array)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()?;
                self.sequence(arity, depth).map(Value::Array)
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let len = self.u16()?;
                Ok(Value::String(latin1(self.take(len)?)))
            }
            LIST_EXT => {
                let len = self.u32()?;
                let mut items = self.sequence(len, depth)?;
                match self.term(depth + 1)? {
                    Value::Array(tail) if tail.is_empty() => {}
                    improper => items.push(improper),
                }
                Ok(Value::Array(items))
            }
            BINARY_EXT => {
                let len = self.u32()?;
                Ok(Value::String(text(self.take(len)?)))
            }
            SMALL_BIG_EXT => {
                let len = usize::from(self.u8()?);
                self.big(len)
            }
            LARGE_BIG_EXT => {
                let len = self.u32()?;
                self.big(len)
            }
            MAP_EXT => {
                let arity = self.u32()?;
                let mut map = Map::new();
                for _ in 0..arity {
                    let key = map_key(self.term(depth + 1)?);
                    let value = self.term(depth + 1)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            COMPRESSED => self.compressed(depth),
            _ => Err(ProtoError::UnknownTag { tag, offset }),
        }
    }

    fn sequence(&mut self, len: usize, depth: usize) -> Result<Vec<Value>, ProtoError> {
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(self.term(depth + 1)?);
        }
        Ok(items)
    }

    fn big(&mut self, len: usize) -> Result<Value, ProtoError> {
        let sign = self.u8()?;
        let digits = self.take(len)?;
        if digits.iter().skip(16).any(|&d| d != 0) {
            return Err(ProtoError::Decoding(
                "big integer wider than 128 bits".to_string(),
            ));
        }

        let magnitude = digits
            .iter()
            .take(16)
            .enumerate()
            .fold(0u128, |acc, (i, &d)| acc | (u128::from(d) << (8 * i)));

        if sign == 0 {
            return Ok(u64::try_from(magnitude)
                .map_or_else(|_| Value::String(magnitude.to_string()), Value::from));
        }

        let negated = i128::try_from(magnitude)
            .ok()
            .and_then(|m| i64::try_from(-m).ok());
        Ok(negated.map_or_else(|| Value::String(format!("-{magnitude}")), Value::from))
    }

    fn compressed(&mut self, depth: usize) -> Result<Value, ProtoError> {
        let size = self.u32()?;
        let mut decoder = ZlibDecoder::new(&self.buf[self.pos..]);
        let mut inflated = Vec::with_capacity(size.min(16 * 1024 * 1024));
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| ProtoError::Decompression(e.to_string()))?;
        if inflated.len() != size {
            return Err(ProtoError::Decompression(format!(
                "compressed term inflated to {} bytes, header said {size}",
                inflated.len()
            )));
        }
        self.pos += decoder.total_in() as usize;

        let mut inner = Reader::new(&inflated);
        let value = inner.term(depth + 1)?;
        if inner.remaining() != 0 {
            return Err(ProtoError::Decoding(
                "trailing bytes inside compressed term".to_string(),
            ));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_encode_heartbeat_frame_bytes() {
        let bytes = to_bytes(&json!({"op": 1, "d": null})).expect("encode");
        let expected: Vec<u8> = vec![
            131, 116, 0, 0, 0, 2, // map, arity 2
            109, 0, 0, 0, 1, b'd', // "d"
            119, 3, b'n', b'i', b'l', // nil
            109, 0, 0, 0, 2, b'o', b'p', // "op"
            97, 1, // 1
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_atom_keys() {
        let bytes = [131, 116, 0, 0, 0, 1, 100, 0, 2, b'o', b'p', 97, 10];
        assert_eq!(from_bytes(&bytes).expect("decode"), json!({"op": 10}));
    }

    #[test]
    fn test_decode_small_big_unsigned() {
        let mut bytes = vec![131, 110, 8, 0];
        bytes.extend_from_slice(&[0xff; 8]);
        assert_eq!(from_bytes(&bytes).expect("decode"), json!(u64::MAX));
    }

    #[test]
    fn test_decode_small_big_negative() {
        let bytes = [131, 110, 2, 1, 0x00, 0x01];
        assert_eq!(from_bytes(&bytes).expect("decode"), json!(-256));
    }

    #[test]
    fn test_decode_wide_big_becomes_string() {
        let mut bytes = vec![131, 110, 9, 0];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            from_bytes(&bytes).expect("decode"),
            json!("18446744073709551616")
        );
    }

    #[test]
    fn test_encode_large_numbers_roundtrip() {
        for value in [json!(300), json!(-5), json!(i64::MIN), json!(u64::MAX), json!(2.5)] {
            let bytes = to_bytes(&value).expect("encode");
            assert_eq!(from_bytes(&bytes).expect("decode"), value);
        }
    }

    #[test]
    fn test_decode_tuple_and_string_ext() {
        let bytes = [131, 104, 2, 97, 1, 107, 0, 2, b'h', b'i'];
        assert_eq!(from_bytes(&bytes).expect("decode"), json!([1, "hi"]));
    }

    #[test]
    fn test_decode_improper_list_keeps_tail() {
        let bytes = [131, 108, 0, 0, 0, 1, 97, 1, 97, 2];
        assert_eq!(from_bytes(&bytes).expect("decode"), json!([1, 2]));
    }

    #[test]
    fn test_decode_old_float() {
        let mut bytes = vec![131, 99];
        let mut repr = b"1.50000000000000000000e+00".to_vec();
        repr.resize(31, 0);
        bytes.extend_from_slice(&repr);
        assert_eq!(from_bytes(&bytes).expect("decode"), json!(1.5));
    }

    #[test]
    fn test_decode_compressed_term() {
        let inner = &to_bytes(&json!({"t": "READY"})).expect("encode")[1..];
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(inner).expect("compress");
        let compressed = encoder.finish().expect("finish");

        let mut bytes = vec![131, COMPRESSED];
        bytes.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&compressed);

        assert_eq!(from_bytes(&bytes).expect("decode"), json!({"t": "READY"}));
    }

    #[test]
    fn test_bad_version_rejected() {
        let err = from_bytes(&[130, 106]).expect_err("should fail");
        assert!(matches!(err, ProtoError::UnsupportedVersion(130)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let err = from_bytes(&[131, 109, 0, 0, 0, 5, b'a']).expect_err("should fail");
        assert!(matches!(err, ProtoError::UnexpectedEof(_)));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = from_bytes(&[131, 200]).expect_err("should fail");
        assert!(matches!(err, ProtoError::UnknownTag { tag: 200, offset: 1 }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(from_bytes(&[131, 106, 106]).is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let mut value = json!(null);
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!([value]);
        }
        assert!(to_bytes(&value).is_err());
    }

    #[test]
    fn test_huge_declared_length_does_not_allocate() {
        let bytes = [131, 108, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            from_bytes(&bytes),
            Err(ProtoError::UnexpectedEof(_))
        ));
    }
}
