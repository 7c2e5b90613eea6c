use std::collections::VecDeque;

pub const MAX_CAPTURED_LINES: usize = 200;

/// Sliding window over the most recent lines of a child's output.
///
/// Chunks may split lines (and multibyte characters) anywhere; the
/// unterminated tail is held back and joined with the next chunk.
#[derive(Debug)]
pub struct OutputCapture {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    max_lines: usize,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::with_max_lines(MAX_CAPTURED_LINES)
    }

    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            max_lines,
        }
    }

    pub fn add_chunk(&mut self, chunk: &[u8]) {
        self.partial.extend_from_slice(chunk);

        let Some(last_nl) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let rest = self.partial.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        // `complete` ends with '\n', so the final split piece is empty
        for raw in complete[..complete.len() - 1].split(|&b| b == b'\n') {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            self.lines.push_back(String::from_utf8_lossy(raw).into_owned());
        }

        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn add_text(&mut self, text: &str) {
        self.add_chunk(text.as_bytes());
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Retained lines plus any unterminated tail, joined with '\n'.
    pub fn text(&self) -> String {
        let mut out: Vec<std::borrow::Cow<'_, str>> =
            self.lines.iter().map(|l| l.as_str().into()).collect();
        if !self.partial.is_empty() {
            out.push(String::from_utf8_lossy(&self.partial));
        }
        out.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_lines_across_chunks() {
        let mut cap = OutputCapture::new();
        cap.add_text("abc");
        assert_eq!(cap.line_count(), 0);
        cap.add_text("def\n");
        assert_eq!(cap.line_count(), 1);
        assert_eq!(cap.text(), "abcdef");
    }

    #[test]
    fn accepts_crlf_and_keeps_partial_in_text() {
        let mut cap = OutputCapture::new();
        cap.add_text("one\r\ntwo\nthr");
        assert_eq!(cap.line_count(), 2);
        assert_eq!(cap.text(), "one\ntwo\nthr");
    }

    #[test]
    fn crlf_split_between_chunks() {
        let mut cap = OutputCapture::new();
        cap.add_text("line\r");
        cap.add_text("\nnext\n");
        assert_eq!(cap.text(), "line\nnext");
    }

    #[test]
    fn keeps_only_most_recent_lines() {
        let mut cap = OutputCapture::new();
        for i in 0..250 {
            cap.add_text(&format!("{}\n", i % 10));
        }
        assert_eq!(cap.line_count(), MAX_CAPTURED_LINES);

        let mut cap = OutputCapture::with_max_lines(3);
        cap.add_text("a\nb\nc\nd\ne\n");
        assert_eq!(cap.text(), "c\nd\ne");
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let bytes = "quota ✓\n".as_bytes();
        let mut cap = OutputCapture::new();
        cap.add_chunk(&bytes[..8]);
        cap.add_chunk(&bytes[8..]);
        assert_eq!(cap.text(), "quota ✓");
    }

    #[test]
    fn empty_lines_are_retained() {
        let mut cap = OutputCapture::new();
        cap.add_text("\n\nx\n");
        assert_eq!(cap.line_count(), 3);
        assert_eq!(cap.text(), "\n\nx");
    }
}
