//! Fixed-size overlapping windows for map-reduce analysis
//!
//! Offsets are in characters, not bytes, so chunk boundaries never split a
//! UTF-8 sequence. The same input and config always produce the same chunks.

use crate::AuditError;
use once_cell::sync::Lazy;
use regex::Regex;

static PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^--- Page (\d+) ---$").unwrap());

/// Chunk size and overlap, in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 20_000,
            overlap: 500,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.size == 0 {
            return Err(AuditError::Config("chunk size must be positive".into()));
        }
        if self.overlap >= self.size {
            return Err(AuditError::Config(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.overlap, self.size
            )));
        }
        Ok(())
    }
}

/// One window of the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position in the sequence
    pub index: usize,
    /// Number of chunks in the sequence
    pub total: usize,
    /// Char offset of the first character
    pub start: usize,
    /// Char offset one past the last character
    pub end: usize,
    pub text: String,
    /// Page the chunk starts on, from the nearest preceding page marker
    pub first_page: Option<u32>,
}

impl Chunk {
    /// 1-based label, e.g. "2/5"
    pub fn label(&self) -> String {
        format!("{}/{}", self.index + 1, self.total)
    }
}

/// Split `text` into windows of `config.size` chars advancing by `size - overlap`
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, AuditError> {
    config.validate()?;

    // byte offset of every char, plus the end of the text
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = boundaries.len() - 1;
    if char_len == 0 {
        return Ok(Vec::new());
    }

    let markers: Vec<(usize, u32)> = PAGE_MARKER
        .captures_iter(text)
        .filter_map(|cap| {
            let offset = cap.get(0)?.start();
            let page = cap.get(1)?.as_str().parse().ok()?;
            Some((offset, page))
        })
        .collect();

    let step = config.size - config.overlap;
    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + config.size).min(char_len);
        spans.push((start, end));
        if end == char_len {
            break;
        }
        start += step;
    }

    let total = spans.len();
    let chunks = spans
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let byte_start = boundaries[start];
            let first_page = markers
                .iter()
                .take_while(|(offset, _)| *offset <= byte_start)
                .last()
                .map(|(_, page)| *page);
            Chunk {
                index,
                total,
                start,
                end,
                text: text[byte_start..boundaries[end]].to_string(),
                first_page,
            }
        })
        .collect();

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize) -> ChunkConfig {
        ChunkConfig { size, overlap }
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(chunk_text("abc", &config(0, 0)).is_err());
        assert!(chunk_text("abc", &config(5, 5)).is_err());
        assert!(chunk_text("abc", &config(5, 4)).is_ok());
    }

    #[test]
    fn test_empty_input() {
        assert!(chunk_text("", &ChunkConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_single_chunk_when_short() {
        let chunks = chunk_text("short text", &ChunkConfig::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short text");
        assert_eq!(chunks[0].label(), "1/1");
    }

    #[test]
    fn test_windows_without_overlap() {
        let chunks = chunk_text("abcdefghij", &config(4, 0)).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
        assert!(chunks.iter().all(|c| c.total == 3));
    }

    #[test]
    fn test_windows_with_overlap() {
        let chunks = chunk_text("abcdefghij", &config(4, 2)).unwrap();
        let spans: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(spans, vec![(0, 4), (2, 6), (4, 8), (6, 10)]);
        assert_eq!(chunks[1].text, "cdef");
    }

    #[test]
    fn test_multibyte_chars() {
        let chunks = chunk_text("ééééé", &config(2, 0)).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn test_first_page_from_markers() {
        let text = "--- Page 1 ---\naaaaaaaaaa\n--- Page 2 ---\nbbbbbbbbbb\n";
        let chunks = chunk_text(text, &config(20, 0)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].first_page, Some(1));
        // starts mid-page 1, before the page 2 marker at char 26
        assert_eq!(chunks[1].first_page, Some(1));
        assert_eq!(chunks[2].first_page, Some(2));
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
    }
}
