//! OSC 52 clipboard extraction from terminal output.
//!
//! Programs set the host clipboard with `ESC ] 52 ; <selection> ; <base64>`
//! terminated by BEL or `ESC \`. Output arrives in arbitrary chunks, so an
//! unterminated sequence is carried into the next call, up to a cap.

use base64::{engine::general_purpose::STANDARD, Engine};

const OSC52_PREFIX: &[u8] = b"\x1b]52;";
const BEL: u8 = 0x07;
const ESC: u8 = 0x1b;

/// Longest unterminated sequence kept between chunks.
pub const MAX_CARRY_BYTES: usize = 64 * 1024;

/// Largest decoded clipboard payload surfaced.
pub const MAX_CLIPBOARD_BYTES: usize = 32 * 1024;

enum Terminator {
    /// Body ends at the first index, sequence ends at the second.
    Found(usize, usize),
    /// Buffer ended before a terminator.
    Incomplete,
    /// A stray escape interrupted the body at this index.
    Broken(usize),
}

/// Incremental OSC 52 scanner for one output stream.
#[derive(Debug, Default)]
pub struct ClipboardScanner {
    carry: Vec<u8>,
}

impl ClipboardScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held back waiting for a terminator.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Scans the next chunk and returns any clipboard texts it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        let mut found = Vec::new();
        let mut pos = 0;

        while let Some(start) = find(&buf[pos..], OSC52_PREFIX).map(|i| pos + i) {
            let body_start = start + OSC52_PREFIX.len();
            match find_terminator(&buf, body_start) {
                Terminator::Found(body_end, next) => {
                    if let Some(text) = decode_body(&buf[body_start..body_end]) {
                        found.push(text);
                    }
                    pos = next;
                }
                Terminator::Broken(at) => pos = at,
                Terminator::Incomplete => {
                    if buf.len() - start <= MAX_CARRY_BYTES {
                        self.carry = buf[start..].to_vec();
                    } else {
                        tracing::debug!("Dropping oversized unterminated OSC 52 sequence");
                    }
                    return found;
                }
            }
        }

        // Keep a trailing partial prefix such as `ESC ] 5`.
        let tail_from = pos.max(buf.len().saturating_sub(OSC52_PREFIX.len() - 1));
        for i in tail_from..buf.len() {
            if OSC52_PREFIX.starts_with(&buf[i..]) {
                self.carry = buf[i..].to_vec();
                break;
            }
        }

        found
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn find_terminator(buf: &[u8], from: usize) -> Terminator {
    let mut i = from;
    while i < buf.len() {
        match buf[i] {
            BEL => return Terminator::Found(i, i + 1),
            ESC => match buf.get(i + 1) {
                Some(b'\\') => return Terminator::Found(i, i + 2),
                Some(_) => return Terminator::Broken(i),
                None => return Terminator::Incomplete,
            },
            _ => i += 1,
        }
    }
    Terminator::Incomplete
}

/// Decodes `<selection>;<base64>`. Queries (`?`), unclean base64, oversized
/// payloads and non-UTF-8 text yield nothing.
fn decode_body(body: &[u8]) -> Option<String> {
    let split = body.iter().position(|&b| b == b';')?;
    let payload = &body[split + 1..];

    if payload.is_empty() || payload == b"?" {
        return None;
    }
    if !payload
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
    {
        return None;
    }
    if payload.len() / 4 * 3 > MAX_CLIPBOARD_BYTES + 3 {
        return None;
    }

    let decoded = STANDARD.decode(payload).ok()?;
    if decoded.len() >= MAX_CLIPBOARD_BYTES {
        return None;
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn osc52(text: &str, terminator: &str) -> Vec<u8> {
        format!("\x1b]52;c;{}{}", STANDARD.encode(text), terminator).into_bytes()
    }

    #[test]
    fn test_bel_terminated() {
        let mut scanner = ClipboardScanner::new();
        let mut chunk = b"prompt$ ".to_vec();
        chunk.extend(osc52("hello", "\x07"));
        chunk.extend(b"more output");
        assert_eq!(scanner.feed(&chunk), vec!["hello".to_string()]);
        assert_eq!(scanner.carry_len(), 0);
    }

    #[test]
    fn test_st_terminated() {
        let mut scanner = ClipboardScanner::new();
        assert_eq!(
            scanner.feed(&osc52("wörld", "\x1b\\")),
            vec!["wörld".to_string()]
        );
    }

    #[test]
    fn test_multiple_in_one_chunk() {
        let mut scanner = ClipboardScanner::new();
        let mut chunk = osc52("one", "\x07");
        chunk.extend(b"\r\n");
        chunk.extend(osc52("two", "\x1b\\"));
        assert_eq!(scanner.feed(&chunk), vec!["one", "two"]);
    }

    #[test]
    fn test_split_across_every_boundary() {
        let seq = osc52("split me", "\x1b\\");
        for cut in 1..seq.len() {
            let mut scanner = ClipboardScanner::new();
            let mut out = scanner.feed(&seq[..cut]);
            out.extend(scanner.feed(&seq[cut..]));
            assert_eq!(out, vec!["split me".to_string()], "cut at {}", cut);
            assert_eq!(scanner.carry_len(), 0);
        }
    }

    #[test]
    fn test_query_is_ignored() {
        let mut scanner = ClipboardScanner::new();
        assert!(scanner.feed(b"\x1b]52;c;?\x07").is_empty());
    }

    #[test]
    fn test_unclean_base64_is_ignored() {
        let mut scanner = ClipboardScanner::new();
        assert!(scanner.feed(b"\x1b]52;c;aGV sbG8=\x07").is_empty());
    }

    #[test]
    fn test_oversized_payload_is_ignored() {
        let mut scanner = ClipboardScanner::new();
        let big = "x".repeat(MAX_CLIPBOARD_BYTES);
        assert!(scanner.feed(&osc52(&big, "\x07")).is_empty());

        let fits = "x".repeat(MAX_CLIPBOARD_BYTES - 1);
        assert_eq!(scanner.feed(&osc52(&fits, "\x07")), vec![fits]);
    }

    #[test]
    fn test_interrupted_sequence_does_not_swallow_next() {
        let mut scanner = ClipboardScanner::new();
        let mut chunk = b"\x1b]52;c;abc".to_vec();
        chunk.extend(osc52("next", "\x07"));
        assert_eq!(scanner.feed(&chunk), vec!["next".to_string()]);
    }

    #[test]
    fn test_carry_is_capped() {
        let mut scanner = ClipboardScanner::new();
        scanner.feed(b"\x1b]52;c;");
        assert!(scanner.carry_len() > 0);

        let filler = vec![b'A'; MAX_CARRY_BYTES];
        assert!(scanner.feed(&filler).is_empty());
        assert_eq!(scanner.carry_len(), 0);

        assert_eq!(scanner.feed(&osc52("after", "\x07")), vec!["after"]);
    }

    #[test]
    fn test_plain_output_leaves_no_carry() {
        let mut scanner = ClipboardScanner::new();
        assert!(scanner.feed(b"just text \x1b[0m done").is_empty());
        assert_eq!(scanner.carry_len(), 0);
    }
}
