//! Line buffering and stream sanitization.
//!
//! Raw stream chunks arrive with arbitrary boundaries; [`LineBuffer`]
//! reassembles complete lines and holds the trailing fragment until the
//! next chunk (or a final flush). Each complete line is stripped of
//! terminal control sequences and inline markup tags, and provider noise
//! lines are dropped before anything downstream sees them.

/// Provider boilerplate prefixes that must never be treated as content.
const NOISE_PREFIXES: &[&str] = &["npm warn", "[DEBUG]", "(node:"];

/// Accumulates raw chunks and yields complete, sanitized lines.
///
/// The trailing incomplete fragment is carried over between calls, so the
/// emitted lines are invariant under re-chunking of the same byte stream.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    carry: String,
}

impl LineBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return all complete sanitized lines.
    ///
    /// Empty and all-noise lines are dropped silently.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.carry.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.find('\n') {
            let line = self.carry[..pos].to_string();
            self.carry.drain(..=pos);
            if let Some(clean) = sanitize_line(&line) {
                lines.push(clean);
            }
        }
        lines
    }

    /// Drain the final partial line on stream end.
    ///
    /// A stream may end without a trailing newline; the carried fragment
    /// must still be processed.
    pub fn flush(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.carry);
        sanitize_line(&line)
    }

    /// Whether a partial line is being carried.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.carry.is_empty()
    }
}

/// Sanitize one complete line.
///
/// Strips control sequences and inline markup, then applies the noise
/// filter. Returns `None` for lines that must not reach the transcript.
#[must_use]
pub fn sanitize_line(line: &str) -> Option<String> {
    let stripped = strip_markup_tags(&strip_control_sequences(line));
    let trimmed = stripped.trim_end_matches('\r');
    if trimmed.is_empty() || is_noise(trimmed) {
        return None;
    }
    Some(trimmed.to_string())
}

/// Sanitize delta text that is not line-oriented (mid-line fragments).
///
/// Same stripping as [`sanitize_line`] but never drops the fragment.
#[must_use]
pub fn sanitize_fragment(text: &str) -> String {
    strip_markup_tags(&strip_control_sequences(text))
}

fn is_noise(line: &str) -> bool {
    NOISE_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Remove terminal escape/control sequences.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL`), bare
/// `ESC <char>` sequences, and stray C0 control bytes other than tab.
#[must_use]
pub fn strip_control_sequences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    // CSI: parameter/intermediate bytes, then final 0x40-0x7e
                    for seq in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&seq) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    // OSC: terminated by BEL or ESC \
                    while let Some(seq) = chars.next() {
                        if seq == '\u{07}' {
                            break;
                        }
                        if seq == '\u{1b}' {
                            if chars.peek() == Some(&'\\') {
                                chars.next();
                            }
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            }
            continue;
        }
        if c.is_control() && c != '\t' && c != '\n' {
            continue;
        }
        out.push(c);
    }
    out
}

/// Remove complete inline markup tags of the form `<u '...' u>` / `</u>`.
#[must_use]
pub fn strip_markup_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('<') {
        let (before, tail) = rest.split_at(start);
        out.push_str(before);

        if let Some(after) = tail.strip_prefix("</u>") {
            rest = after;
        } else if tail.starts_with("<u ") || tail.starts_with("<u'") {
            // Opening tag runs through the matching " u>".
            if let Some(end) = tail.find(" u>") {
                rest = &tail[end + 3..];
            } else {
                // Unterminated tag: keep literal text, nothing to strip.
                out.push_str(tail);
                return out;
            }
        } else {
            out.push('<');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Trim an incomplete trailing markup tag from a draft.
///
/// A streamed delta may be cut mid-tag; the cut prefix must not survive
/// into a finalized message.
#[must_use]
pub fn trim_partial_trailing_tag(draft: &str) -> &str {
    if let Some(pos) = draft.rfind('<') {
        let suffix = &draft[pos..];
        let looks_like_tag = suffix == "<"
            || (suffix.starts_with("<u") && !suffix.contains(" u>"))
            || (suffix.starts_with("</") && !suffix.contains('>'));
        if looks_like_tag {
            return &draft[..pos];
        }
    }
    draft
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_splits_complete_lines_and_carries_fragment() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.feed("hello\nwor"), vec!["hello".to_string()]);
        assert!(buf.has_partial());
        assert_eq!(buf.feed("ld\n"), vec!["world".to_string()]);
        assert!(!buf.has_partial());
    }

    #[test]
    fn feed_is_chunk_boundary_invariant() {
        let stream = "alpha\nbeta\ngamma\ndelta";
        let chunkings: &[&[usize]] = &[&[22], &[1, 21], &[5, 5, 5, 7], &[10, 12], &[3, 3, 16]];

        let mut expected: Vec<String> = Vec::new();
        {
            let mut buf = LineBuffer::new();
            expected.extend(buf.feed(stream));
            expected.extend(buf.flush());
        }

        for sizes in chunkings {
            let mut buf = LineBuffer::new();
            let mut got = Vec::new();
            let mut rest = stream;
            for &n in *sizes {
                let (chunk, tail) = rest.split_at(n.min(rest.len()));
                got.extend(buf.feed(chunk));
                rest = tail;
            }
            got.extend(buf.flush());
            assert_eq!(got, expected, "chunking {sizes:?}");
        }
    }

    #[test]
    fn flush_recovers_line_without_trailing_newline() {
        let mut buf = LineBuffer::new();
        assert!(buf.feed("partial").is_empty());
        assert_eq!(buf.flush(), Some("partial".to_string()));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn empty_and_noise_lines_are_dropped() {
        let mut buf = LineBuffer::new();
        let lines = buf.feed("\nnpm warn deprecated thing\n[DEBUG] internal\nreal content\n");
        assert_eq!(lines, vec!["real content".to_string()]);
    }

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_control_sequences("\u{1b}[31mred\u{1b}[0m"), "red");
    }

    #[test]
    fn strips_osc_sequences() {
        assert_eq!(strip_control_sequences("\u{1b}]0;title\u{07}text"), "text");
    }

    #[test]
    fn strips_markup_around_command() {
        // sanitize+strip on inline command markup
        assert_eq!(
            sanitize_line("<u 'command' u>ls -la</u>"),
            Some("ls -la".to_string())
        );
    }

    #[test]
    fn keeps_plain_angle_brackets() {
        assert_eq!(strip_markup_tags("a < b && b > c"), "a < b && b > c");
    }

    #[test]
    fn trims_partial_trailing_tag() {
        assert_eq!(trim_partial_trailing_tag("output <u 'comm"), "output ");
        assert_eq!(trim_partial_trailing_tag("output </"), "output ");
        assert_eq!(trim_partial_trailing_tag("a < b"), "a < b");
        assert_eq!(trim_partial_trailing_tag("done"), "done");
    }
}
