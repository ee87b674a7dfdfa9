//! Hex projection of payload bytes.
//!
//! Bytes render as lowercase, space separated pairs (`aa bb cc`). Parsing is
//! whitespace tolerant and case insensitive. Patterns additionally accept `??`
//! as a single-byte wildcard.

use crate::utils::error::{AppError, AppResult};

/// Render bytes as `aa bb cc`
pub fn encode(bytes: &[u8]) -> String {
    let compact = hex::encode(bytes);
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, c) in compact.chars().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Parse a hex string back into bytes, ignoring whitespace
pub fn decode(input: &str) -> AppResult<Vec<u8>> {
    let compact = compact(input);
    hex::decode(&compact).map_err(|e| AppError::InvalidPattern(format!("'{}': {}", input, e)))
}

/// Parse a hex pattern where `??` matches any byte
pub fn decode_pattern(input: &str) -> AppResult<Vec<Option<u8>>> {
    let compact: Vec<char> = compact(input).chars().collect();
    if compact.is_empty() {
        return Err(AppError::InvalidPattern("empty hex pattern".to_string()));
    }
    if compact.len() % 2 != 0 {
        return Err(AppError::InvalidPattern(format!(
            "'{}': odd number of hex digits",
            input
        )));
    }

    let mut pattern = Vec::with_capacity(compact.len() / 2);
    for pair in compact.chunks(2) {
        match (pair[0], pair[1]) {
            ('?', '?') => pattern.push(None),
            (hi, lo) => {
                let digits: String = [hi, lo].iter().collect();
                let byte = hex::decode(&digits)
                    .map_err(|e| AppError::InvalidPattern(format!("'{}': {}", input, e)))?;
                pattern.push(Some(byte[0]));
            }
        }
    }
    Ok(pattern)
}

/// Whether a free-form feature string should be read as hex
pub fn looks_like_hex(input: &str) -> bool {
    let mut seen = false;
    for c in input.chars() {
        if c.is_whitespace() {
            continue;
        }
        if !(c.is_ascii_hexdigit() || c == '?') {
            return false;
        }
        seen = true;
    }
    seen
}

/// Map a `[start, end)` char range of the rendered projection to the byte span it covers
pub fn projection_span_to_bytes(start: usize, end: usize) -> (usize, usize) {
    let first = start / 3;
    let last = end.saturating_sub(1) / 3;
    (first, last + 1)
}

fn compact(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_spacing() {
        assert_eq!(encode(&[0xaa, 0xbb, 0x0c]), "aa bb 0c");
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn test_decode_reproduces_bytes() {
        let raw: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&raw)).unwrap(), raw);
    }

    #[test]
    fn test_decode_accepts_mixed_case_and_spacing() {
        assert_eq!(decode("AA bb\tCc").unwrap(), vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(decode("aabbcc").unwrap(), vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        assert!(matches!(decode("aa b"), Err(AppError::InvalidPattern(_))));
    }

    #[test]
    fn test_decode_pattern_wildcards() {
        let pattern = decode_pattern("bb ?? DD").unwrap();
        assert_eq!(pattern, vec![Some(0xbb), None, Some(0xdd)]);
    }

    #[test]
    fn test_decode_pattern_rejects_bad_digits() {
        assert!(decode_pattern("gg ?? dd").is_err());
        assert!(decode_pattern("a ?? d").is_err());
        assert!(decode_pattern("a? bb").is_err());
        assert!(decode_pattern("   ").is_err());
    }

    #[test]
    fn test_looks_like_hex() {
        assert!(looks_like_hex("AA BB"));
        assert!(looks_like_hex("bb ?? dd"));
        assert!(!looks_like_hex("hello"));
        assert!(!looks_like_hex(""));
    }

    #[test]
    fn test_projection_span_to_bytes() {
        // "aa bb cc": "bb" sits at chars 3..5
        assert_eq!(projection_span_to_bytes(3, 5), (1, 2));
        // "a bb c" straddles three bytes
        assert_eq!(projection_span_to_bytes(1, 7), (0, 3));
    }
}
