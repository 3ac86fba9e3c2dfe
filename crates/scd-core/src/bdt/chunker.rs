//! Serving a rendered block over a bounded-payload channel.

use super::text::END_OF_DATA;

/// Rendered text plus a forward-only read cursor.
#[derive(Debug, Clone, Default)]
pub struct TextBlock {
    text: String,
    cursor: usize,
}

impl TextBlock {
    pub fn new(text: String) -> Self {
        Self { text, cursor: 0 }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Every byte has been served.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.text.len()
    }

    /// Next chunk of at most `max` bytes, ending on a line boundary.
    ///
    /// A single line longer than `max` is returned whole. Once the text is
    /// exhausted the terminal [`END_OF_DATA`] chunk is returned and the cursor
    /// rewinds to the start.
    pub fn get_chunk(&mut self, max: usize) -> String {
        if self.is_exhausted() {
            self.cursor = 0;
            return END_OF_DATA.to_string();
        }
        let rest = &self.text[self.cursor..];
        let take = if rest.len() <= max {
            rest.len()
        } else {
            let window = &rest.as_bytes()[..max];
            match window.iter().rposition(|&b| b == b'\n') {
                Some(nl) => nl + 1,
                None => rest.find('\n').map_or(rest.len(), |nl| nl + 1),
            }
        };
        let chunk = rest[..take].to_string();
        self.cursor += take;
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text() -> String {
        let mut text = String::new();
        let mut n = 0;
        while text.len() < 200 {
            n += 1;
            text.push_str(&format!("{:6},      0.{:03},     12\n", n, n));
        }
        text.truncate(text.rfind('\n').map_or(0, |i| i + 1));
        text
    }

    #[test]
    fn test_chunks_of_64_rejoin_without_split_rows() {
        let text = sample_text();
        assert!(text.len() >= 200);
        let mut block = TextBlock::new(text.clone());

        let mut joined = String::new();
        loop {
            let chunk = block.get_chunk(64);
            if chunk == END_OF_DATA {
                break;
            }
            assert!(chunk.len() <= 64);
            assert!(chunk.ends_with('\n'));
            joined.push_str(&chunk);
        }
        assert_eq!(joined, text);
        // rewound
        assert!(!block.is_exhausted());
    }

    #[test]
    fn test_oversize_line_is_not_split() {
        let long = format!("{}\n", "x".repeat(100));
        let mut block = TextBlock::new(format!("ab\n{long}cd\n"));
        assert_eq!(block.get_chunk(16), "ab\n");
        assert_eq!(block.get_chunk(16), long);
        assert_eq!(block.get_chunk(16), "cd\n");
        assert!(block.is_exhausted());
        assert_eq!(block.get_chunk(16), END_OF_DATA);
    }

    #[test]
    fn test_tail_without_newline() {
        let mut block = TextBlock::new("abc\ndef".to_string());
        assert_eq!(block.get_chunk(5), "abc\n");
        assert_eq!(block.get_chunk(5), "def");
        assert_eq!(block.get_chunk(5), END_OF_DATA);
    }

    #[test]
    fn test_empty_block_is_terminal() {
        let mut block = TextBlock::default();
        assert_eq!(block.get_chunk(64), END_OF_DATA);
    }
}
