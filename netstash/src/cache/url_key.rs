//! 64-bit cache keys derived from URLs.

/// Hashes a URL to its cache key with a folded multiply-add over the
/// bytes: `h = h * 31 + (b - 32)`, wrapping on overflow. URLs are
/// expected to be printable ASCII; collisions are caught later by
/// comparing the URL stored in the sidecar.
pub fn url_key(url: &str) -> u64 {
    url.bytes().fold(0u64, |h, b| {
        h.wrapping_mul(31).wrapping_add((b as u64).wrapping_sub(32))
    })
}

/// File name of the data file for a key (lowercase hex, no padding).
pub fn key_file_name(key: u64) -> String {
    format!("{key:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_hashes_to_zero() {
        assert_eq!(url_key(""), 0);
    }

    #[test]
    fn test_single_character() {
        // ' ' is the folding origin, so it contributes zero.
        assert_eq!(url_key(" "), 0);
        assert_eq!(url_key("!"), 1);
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        assert_ne!(url_key("ab"), url_key("ba"));
        assert_eq!(url_key("ab"), 31 * (b'a' as u64 - 32) + (b'b' as u64 - 32));
    }

    #[test]
    fn test_long_urls_wrap_without_panicking() {
        let url = format!("https://example.com/{}", "x".repeat(4096));
        let key = url_key(&url);
        assert_eq!(key, url_key(&url));
    }

    #[test]
    fn test_high_bit_keys_format_losslessly() {
        let mut url = String::new();
        while url_key(&url) < 1 << 63 {
            url.push('~');
        }
        let key = url_key(&url);
        assert_eq!(u64::from_str_radix(&key_file_name(key), 16).unwrap(), key);
    }
}
