//! Percent-encoding of a whole URL as a single local path segment.
//!
//! The range proxy addresses upstream URLs as
//! `http://127.0.0.1:<port>/<percent-encoded-url>`; everything outside
//! the RFC 3986 unreserved set is escaped so the URL survives as one
//! segment.

/// Escapes every byte outside `A-Z a-z 0-9 - _ . ~`.
pub fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap().to_ascii_uppercase());
                out.push(char::from_digit((byte & 0xF) as u32, 16).unwrap().to_ascii_uppercase());
            }
        }
    }
    out
}

/// Reverses [`encode_component`]. Returns `None` for truncated or
/// non-hex escapes and for sequences that do not form valid UTF-8.
pub fn decode_component(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_roundtrip() {
        let url = "https://example.com/images/a b.png?size=100&q=80#frag";
        let encoded = encode_component(url);
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('?'));
        assert_eq!(decode_component(&encoded).as_deref(), Some(url));
    }

    #[test]
    fn test_unreserved_characters_pass_through() {
        assert_eq!(encode_component("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
    }

    #[test]
    fn test_multibyte_utf8() {
        let input = "https://example.com/π";
        assert_eq!(
            decode_component(&encode_component(input)).as_deref(),
            Some(input)
        );
    }

    #[test]
    fn test_invalid_escapes_rejected() {
        assert_eq!(decode_component("%"), None);
        assert_eq!(decode_component("%2"), None);
        assert_eq!(decode_component("%zz"), None);
        assert_eq!(decode_component("%FF"), None); // lone continuation byte
    }
}
