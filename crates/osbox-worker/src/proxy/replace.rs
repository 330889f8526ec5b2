use std::collections::HashMap;

/// Streaming byte replacer for the client→upstream direction.
///
/// Substitutes sealed tokens with their real values on raw post-TLS bytes. A
/// token may be split across two reads, so a suffix that is a prefix of some
/// token is held back until the next chunk (or `finish`) settles it.
pub struct StreamReplacer {
    subs: Vec<(Vec<u8>, Vec<u8>)>,
    tail: Vec<u8>,
}

impl StreamReplacer {
    pub fn new(substitutions: &HashMap<String, String>) -> Self {
        Self {
            subs: substitutions
                .iter()
                .map(|(token, value)| (token.as_bytes().to_vec(), value.as_bytes().to_vec()))
                .collect(),
            tail: Vec::new(),
        }
    }

    /// Whether this replacer has any substitutions to perform. Sessions
    /// without secrets skip the scan entirely.
    pub fn is_identity(&self) -> bool {
        self.subs.is_empty()
    }

    /// Feed one chunk; returns the bytes safe to forward upstream.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.subs.is_empty() {
            return chunk.to_vec();
        }

        self.tail.extend_from_slice(chunk);
        let buf = std::mem::take(&mut self.tail);
        let mut out = Vec::with_capacity(buf.len());

        let mut i = 0;
        'outer: while i < buf.len() {
            let rest = &buf[i..];
            for (token, value) in &self.subs {
                if rest.starts_with(token) {
                    out.extend_from_slice(value);
                    i += token.len();
                    continue 'outer;
                }
            }
            // A partial token at the end of the buffer must wait for more
            // bytes before it can be decided.
            if self.is_partial_token(rest) {
                self.tail.extend_from_slice(rest);
                break;
            }
            out.push(buf[i]);
            i += 1;
        }

        out
    }

    /// Flush anything held back. Called when the client side closes.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tail)
    }

    fn is_partial_token(&self, rest: &[u8]) -> bool {
        self.subs
            .iter()
            .any(|(token, _)| rest.len() < token.len() && token.starts_with(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replacer(pairs: &[(&str, &str)]) -> StreamReplacer {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(t, v)| (t.to_string(), v.to_string()))
            .collect();
        StreamReplacer::new(&map)
    }

    const TOKEN: &str = "osb_sealed_00112233445566778899aabbccddeeff";

    #[test]
    fn replaces_whole_token_in_one_chunk() {
        let mut r = replacer(&[(TOKEN, "sk-real-123")]);
        let input = format!("x-t: {}\r\n", TOKEN);
        let mut out = r.feed(input.as_bytes());
        out.extend(r.finish());
        assert_eq!(out, b"x-t: sk-real-123\r\n");
    }

    #[test]
    fn replaces_token_split_across_chunks() {
        let mut r = replacer(&[(TOKEN, "sk-real-123")]);
        let input = format!("Authorization: Bearer {}!", TOKEN);
        let bytes = input.as_bytes();

        // Split in the middle of the token.
        let split = input.find("osb_sealed_").unwrap() + 17;
        let mut out = r.feed(&bytes[..split]);
        out.extend(r.feed(&bytes[split..]));
        out.extend(r.finish());

        assert_eq!(out, b"Authorization: Bearer sk-real-123!");
    }

    #[test]
    fn replaces_byte_at_a_time() {
        let mut r = replacer(&[(TOKEN, "v")]);
        let input = format!("a{}b", TOKEN);
        let mut out = Vec::new();
        for byte in input.as_bytes() {
            out.extend(r.feed(std::slice::from_ref(byte)));
        }
        out.extend(r.finish());
        assert_eq!(out, b"avb");
    }

    #[test]
    fn passes_through_non_token_bytes() {
        let mut r = replacer(&[(TOKEN, "v")]);
        let mut out = r.feed(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        out.extend(r.finish());
        assert_eq!(out, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[test]
    fn prefix_lookalike_is_flushed_on_finish() {
        let mut r = replacer(&[(TOKEN, "v")]);
        // Stream ends in the middle of what could have become a token.
        let mut out = r.feed(b"payload osb_sealed_0011");
        out.extend(r.finish());
        assert_eq!(out, b"payload osb_sealed_0011");
    }

    #[test]
    fn multiple_tokens_in_one_stream() {
        let other = "osb_sealed_ffeeddccbbaa99887766554433221100";
        let mut r = replacer(&[(TOKEN, "first"), (other, "second")]);
        let input = format!("{} and {}", TOKEN, other);
        let mut out = r.feed(input.as_bytes());
        out.extend(r.finish());
        assert_eq!(out, b"first and second");
    }

    #[test]
    fn repeated_token_occurrences() {
        let mut r = replacer(&[(TOKEN, "v")]);
        let input = format!("{}{}", TOKEN, TOKEN);
        let mut out = r.feed(input.as_bytes());
        out.extend(r.finish());
        assert_eq!(out, b"vv");
    }

    #[test]
    fn identity_replacer_is_passthrough() {
        let mut r = replacer(&[]);
        assert!(r.is_identity());
        assert_eq!(r.feed(b"osb_sealed_raw"), b"osb_sealed_raw");
    }

    #[test]
    fn value_longer_than_token_is_fine() {
        let long_value = "x".repeat(200);
        let mut r = replacer(&[(TOKEN, long_value.as_str())]);
        let mut out = r.feed(TOKEN.as_bytes());
        out.extend(r.finish());
        assert_eq!(out, long_value.as_bytes());
    }
}
