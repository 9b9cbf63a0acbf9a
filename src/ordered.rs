//! Order-preserving encoding of heterogeneous key tuples.
//!
//! The database keys used throughout this crate are tuples such as
//! `("Event", project, issue, api, id)`. [`encode`] turns such a tuple
//! into a byte string whose `memcmp` order equals the tuple order, so
//! that ordered range scans over the key-value store visit entries in
//! tuple order. Using a plain textual encoding instead would visit
//! issue 1001 before issue 123, because `"1001" < "123"`.
//!
//! Each element is self-delimiting, so a prefix of a tuple can be
//! decoded without knowing what follows ([`decode_prefix`]). That is
//! what lets the time-index scans peel `(kind, modtime)` off the front
//! of a key and treat the rest as an opaque sub-key.
//!
//! The element kinds and their tags:
//!
//! | Tag | Kind | Encoding |
//! |-----|------|----------|
//! | `0x01` | string / bytes | data with `0x00` escaped as `0x00 0xFF`, terminated by `0x00 0x01` |
//! | `0x02` | signed integer | 8 bytes big-endian, sign bit flipped |
//! | `0x03` | unsigned integer above `i64::MAX` | 8 bytes big-endian |
//! | `0xFF` | [`Elem::Inf`] | tag only |
//!
//! The escape byte `0xFF` sorts above the terminator byte `0x01`, and
//! the terminator's leading `0x00` sorts below any data byte, so string
//! order is preserved including embedded NULs and prefixes. Unsigned
//! values that fit in an `i64` share the signed representation, which
//! keeps mixed signed/unsigned positions numerically ordered. `Inf`
//! sorts strictly above every finite element and is used to build
//! inclusive scan bounds covering "everything with this prefix".

use std::fmt::Write as _;

use anyhow::{bail, Result};

/// A single element of a key tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Elem {
    /// A signed integer.
    Int(i64),
    /// An unsigned integer. Values that fit in an `i64` decode as [`Elem::Int`].
    Uint(u64),
    /// A UTF-8 string.
    Str(String),
    /// Raw bytes. Byte elements that happen to be valid UTF-8 decode as [`Elem::Str`].
    Bytes(Vec<u8>),
    /// The sentinel that sorts above every finite element of its position.
    /// `Inf` cannot be decoded back; it only appears in scan bounds.
    Inf,
}

impl From<i64> for Elem {
    fn from(v: i64) -> Elem {
        Elem::Int(v)
    }
}

impl From<u64> for Elem {
    fn from(v: u64) -> Elem {
        Elem::Uint(v)
    }
}

impl From<&str> for Elem {
    fn from(v: &str) -> Elem {
        Elem::Str(v.to_string())
    }
}

impl From<String> for Elem {
    fn from(v: String) -> Elem {
        Elem::Str(v)
    }
}

impl From<&String> for Elem {
    fn from(v: &String) -> Elem {
        Elem::Str(v.clone())
    }
}

impl From<&[u8]> for Elem {
    fn from(v: &[u8]) -> Elem {
        Elem::Bytes(v.to_vec())
    }
}

const TAG_STR: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_UINT: u8 = 0x03;
const TAG_INF: u8 = 0xFF;

/// Builds an encoded key from anything convertible to [`Elem`].
///
/// ```
/// use issuebot::okey;
/// use issuebot::ordered::Elem;
///
/// let a = okey!("issue", 123i64);
/// let b = okey!("issue", 1001i64);
/// let top = okey!("issue", Elem::Inf);
/// assert!(a < b && b < top);
/// ```
#[macro_export]
macro_rules! okey {
    ($($x:expr),* $(,)?) => {
        $crate::ordered::encode(&[$($crate::ordered::Elem::from($x)),*])
    };
}

/// Encodes a tuple of elements into a byte string whose byte order
/// equals the tuple order.
pub fn encode(elems: &[Elem]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * elems.len());
    for e in elems {
        encode_one(&mut out, e);
    }
    out
}

fn encode_one(out: &mut Vec<u8>, e: &Elem) {
    match e {
        Elem::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        Elem::Uint(v) => {
            if *v <= i64::MAX as u64 {
                out.push(TAG_INT);
                out.extend_from_slice(&(v ^ (1 << 63)).to_be_bytes());
            } else {
                out.push(TAG_UINT);
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        Elem::Str(s) => encode_bytes(out, s.as_bytes()),
        Elem::Bytes(b) => encode_bytes(out, b),
        Elem::Inf => out.push(TAG_INF),
    }
}

fn encode_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.push(TAG_STR);
    for &b in data {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

/// Decodes a complete encoded tuple. Fails if any bytes remain after
/// the last element.
pub fn decode(data: &[u8]) -> Result<Vec<Elem>> {
    let mut elems = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (e, r) = decode_one(rest)?;
        elems.push(e);
        rest = r;
    }
    Ok(elems)
}

/// Decodes the first `n` elements of an encoded tuple, returning them
/// together with the undecoded remainder of the input.
pub fn decode_prefix(data: &[u8], n: usize) -> Result<(Vec<Elem>, &[u8])> {
    let mut elems = Vec::with_capacity(n);
    let mut rest = data;
    for _ in 0..n {
        let (e, r) = decode_one(rest)?;
        elems.push(e);
        rest = r;
    }
    Ok((elems, rest))
}

fn decode_one(data: &[u8]) -> Result<(Elem, &[u8])> {
    let Some((&tag, rest)) = data.split_first() else {
        bail!("ordered: truncated input");
    };
    match tag {
        TAG_INT => {
            if rest.len() < 8 {
                bail!("ordered: truncated integer");
            }
            let raw = u64::from_be_bytes(rest[..8].try_into().unwrap());
            Ok((Elem::Int((raw ^ (1 << 63)) as i64), &rest[8..]))
        }
        TAG_UINT => {
            if rest.len() < 8 {
                bail!("ordered: truncated integer");
            }
            let v = u64::from_be_bytes(rest[..8].try_into().unwrap());
            Ok((Elem::Uint(v), &rest[8..]))
        }
        TAG_STR => {
            let mut buf = Vec::new();
            let mut i = 0;
            loop {
                let Some(&b) = rest.get(i) else {
                    bail!("ordered: unterminated string");
                };
                if b != 0x00 {
                    buf.push(b);
                    i += 1;
                    continue;
                }
                match rest.get(i + 1) {
                    Some(0xFF) => {
                        buf.push(0x00);
                        i += 2;
                    }
                    Some(0x01) => {
                        let rest = &rest[i + 2..];
                        let e = match String::from_utf8(buf) {
                            Ok(s) => Elem::Str(s),
                            Err(e) => Elem::Bytes(e.into_bytes()),
                        };
                        return Ok((e, rest));
                    }
                    _ => bail!("ordered: bad string escape"),
                }
            }
        }
        TAG_INF => bail!("ordered: cannot decode Inf"),
        _ => bail!("ordered: bad tag {tag:#04x}"),
    }
}

impl Elem {
    /// The string value, if this element is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Elem::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer value, widened from either integer representation.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Elem::Int(v) => Some(*v),
            Elem::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// Formats possibly-encoded data for log and panic messages: decoded
/// tuple form when the bytes parse as an encoding, a quoted string
/// otherwise.
pub fn fmt(data: &[u8]) -> String {
    if let Ok(elems) = decode(data) {
        if !elems.is_empty() {
            let mut s = String::from("(");
            for (i, e) in elems.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                match e {
                    Elem::Int(v) => {
                        let _ = write!(s, "{v}");
                    }
                    Elem::Uint(v) => {
                        let _ = write!(s, "{v}");
                    }
                    Elem::Str(v) => {
                        let _ = write!(s, "{v:?}");
                    }
                    Elem::Bytes(v) => {
                        let _ = write!(s, "{}", String::from_utf8_lossy(v));
                    }
                    Elem::Inf => s.push_str("Inf"),
                }
            }
            s.push(')');
            return s;
        }
    }
    format!("{:?}", String::from_utf8_lossy(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(elems: &[Elem]) {
        let enc = encode(elems);
        let dec = decode(&enc).unwrap();
        assert_eq!(dec, elems, "roundtrip of {elems:?}");
    }

    #[test]
    fn test_roundtrip() {
        roundtrip(&[Elem::Str("Event".into())]);
        roundtrip(&[
            Elem::Str("Event".into()),
            Elem::Str("golang/go".into()),
            Elem::Int(123),
            Elem::Str("/issues".into()),
            Elem::Int(999_999_999_999),
        ]);
        roundtrip(&[Elem::Int(0), Elem::Int(-1), Elem::Int(i64::MIN), Elem::Int(i64::MAX)]);
        roundtrip(&[Elem::Str(String::new()), Elem::Str("a\x00b".into())]);
        roundtrip(&[Elem::Uint(u64::MAX)]);
    }

    #[test]
    fn test_int_order() {
        let vals = [i64::MIN, -1_000_000, -1, 0, 1, 123, 1001, i64::MAX];
        for w in vals.windows(2) {
            assert!(
                okey!(w[0]) < okey!(w[1]),
                "expected {} < {} in encoded order",
                w[0],
                w[1]
            );
        }
        // Large unsigned values sort above every signed value.
        assert!(okey!(i64::MAX) < okey!(u64::MAX));
    }

    #[test]
    fn test_string_order() {
        let vals = ["", "a", "a\x00", "a\x00b", "ab", "b", "ba"];
        for w in vals.windows(2) {
            assert!(
                okey!(w[0]) < okey!(w[1]),
                "expected {:?} < {:?} in encoded order",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_tuple_order_matches_component_order() {
        assert!(okey!("issue", 123i64) < okey!("issue", 1001i64));
        assert!(okey!("a", 9i64) < okey!("b", 1i64));
        assert!(okey!("issue") < okey!("issue", i64::MIN));
    }

    #[test]
    fn test_inf_sorts_above_everything() {
        let top = okey!(Elem::Inf);
        for enc in [okey!(i64::MAX), okey!(u64::MAX), okey!("zzzz"), okey!("")] {
            assert!(enc < top);
        }
        // And as a tuple tail, above every same-prefix key.
        assert!(okey!("Event", i64::MAX) < okey!("Event", Elem::Inf));
    }

    #[test]
    fn test_decode_prefix() {
        let enc = okey!("Event", "golang/go", 7i64);
        let (elems, rest) = decode_prefix(&enc, 1).unwrap();
        assert_eq!(elems, vec![Elem::Str("Event".into())]);
        let tail = decode(rest).unwrap();
        assert_eq!(tail, vec![Elem::Str("golang/go".into()), Elem::Int(7)]);
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode(&[0x02, 1, 2]).is_err());
        assert!(decode(&[0x01, b'a']).is_err());
        assert!(decode(&[0x7A]).is_err());
        assert!(decode(&okey!(Elem::Inf)).is_err());
    }

    #[test]
    fn test_fmt() {
        assert_eq!(fmt(&okey!("docs.Doc", 5i64)), r#"("docs.Doc", 5)"#);
        assert_eq!(fmt(b"plain"), "\"plain\"");
    }
}
