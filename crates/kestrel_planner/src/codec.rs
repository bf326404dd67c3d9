//! Order-preserving composite key codec.
//!
//! Composite keys are arrays of encoded elements joined into one byte string
//! whose lexicographic order equals element-wise lexicographic order. Each
//! element is written with `0x00` escaped as `0x00 0xFF` and terminated by
//! `0x00 0x00`, so a shorter array sorts before any extension of it and
//! element boundaries survive byte-wise prefix comparison.
//!
//! Descending collation is applied per element by complementing the element
//! bytes before joining; complementing reverses the order of any two encoded
//! elements of the same key position.

use kestrel_common::error::ScanError;
use kestrel_common::KestrelResult;

const ESC: u8 = 0x00;
const ESC_LIT: u8 = 0xFF;
const TERM: u8 = 0x00;

/// Encoded JSON null, the smallest non-missing element value.
pub const ENC_NULL: &[u8] = &[0x02];

/// True when `b` is exactly the encoded null element.
pub fn is_encoded_null(b: &[u8]) -> bool {
    b == ENC_NULL
}

/// Join encoded elements into one composite key.
pub fn join_array<B: AsRef<[u8]>>(parts: &[B]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.as_ref().len() + 2).sum());
    for p in parts {
        for &byte in p.as_ref() {
            if byte == ESC {
                out.push(ESC);
                out.push(ESC_LIT);
            } else {
                out.push(byte);
            }
        }
        out.push(ESC);
        out.push(TERM);
    }
    out
}

/// Split a composite key back into its elements.
pub fn split_array(joined: &[u8]) -> KestrelResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut cur = Vec::new();
    let mut i = 0;
    while i < joined.len() {
        let b = joined[i];
        if b == ESC {
            let Some(&next) = joined.get(i + 1) else {
                return Err(ScanError::InvalidRequest("truncated composite key".into()).into());
            };
            match next {
                ESC_LIT => cur.push(ESC),
                TERM => out.push(std::mem::take(&mut cur)),
                _ => {
                    return Err(ScanError::InvalidRequest("malformed composite key escape".into()).into())
                }
            }
            i += 2;
        } else {
            cur.push(b);
            i += 1;
        }
    }
    if !cur.is_empty() {
        return Err(ScanError::InvalidRequest("composite key missing terminator".into()).into());
    }
    Ok(out)
}

/// Complement the bytes of every element whose position is marked descending.
pub fn reverse_collate(joined: &[u8], desc: &[bool]) -> KestrelResult<Vec<u8>> {
    if !desc.iter().any(|d| *d) {
        return Ok(joined.to_vec());
    }
    let mut parts = split_array(joined)?;
    for (i, part) in parts.iter_mut().enumerate() {
        if desc.get(i).copied().unwrap_or(false) {
            for b in part.iter_mut() {
                *b = !*b;
            }
        }
    }
    Ok(join_array(&parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_split_round_trip() {
        let parts: Vec<Vec<u8>> = vec![b"paris".to_vec(), vec![0x00, 0x42], vec![]];
        let joined = join_array(&parts);
        assert_eq!(split_array(&joined).unwrap(), parts);
    }

    #[test]
    fn test_join_preserves_elementwise_order() {
        let ab = join_array(&[b"a".as_ref(), b"b".as_ref()]);
        let ac = join_array(&[b"a".as_ref(), b"c".as_ref()]);
        let b = join_array(&[b"b".as_ref()]);
        assert!(ab < ac);
        assert!(ac < b);
        // A prefix array sorts before its extensions.
        let a = join_array(&[b"a".as_ref()]);
        assert!(a < ab);
    }

    #[test]
    fn test_zero_bytes_do_not_break_ordering() {
        let low = join_array(&[vec![0x00]]);
        let empty = join_array(&[vec![]]);
        assert!(empty < low);
    }

    #[test]
    fn test_reverse_collate_flips_marked_elements() {
        let j1 = join_array(&[b"a".as_ref(), b"x".as_ref()]);
        let j2 = join_array(&[b"a".as_ref(), b"y".as_ref()]);
        assert!(j1 < j2);
        let r1 = reverse_collate(&j1, &[false, true]).unwrap();
        let r2 = reverse_collate(&j2, &[false, true]).unwrap();
        // Order of the second element reverses, the first is untouched.
        assert!(r2 < r1);
        let back = reverse_collate(&r1, &[false, true]).unwrap();
        assert_eq!(back, j1);
    }

    #[test]
    fn test_reverse_collate_all_ascending_is_identity() {
        let j = join_array(&[b"a".as_ref()]);
        assert_eq!(reverse_collate(&j, &[false]).unwrap(), j);
    }

    #[test]
    fn test_malformed_key_rejected() {
        assert!(split_array(&[0x61, 0x00]).is_err());
        assert!(split_array(&[0x61]).is_err());
        assert!(split_array(&[0x00, 0x07]).is_err());
    }

    #[test]
    fn test_encoded_null() {
        assert!(is_encoded_null(ENC_NULL));
        assert!(!is_encoded_null(b"a"));
    }
}
