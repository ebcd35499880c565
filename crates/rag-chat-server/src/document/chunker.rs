//! Structure-aware text splitting. Paragraph breaks are respected first,
//! then sentence boundaries, and only oversized sentences are force-split
//! at `chunk_size` characters with `chunk_overlap` of overlap.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::text::{content_hash, normalize_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Text,
    List,
    Table,
    Heading,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::List => "list",
            Self::Table => "table",
            Self::Heading => "heading",
        }
    }
}

/// A chunk before embedding: normalized content plus the metadata the
/// ingestor persists alongside it.
#[derive(Debug, Clone)]
pub struct DraftChunk {
    pub text: String,
    pub content_hash: String,
    pub page_number: usize,
    pub chunk_type: ChunkType,
    pub word_count: usize,
}

#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunks: Vec<DraftChunk>,
    /// Exact duplicates dropped within this document
    pub duplicates_skipped: usize,
}

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([-*•▪◦]|\d{1,3}[.)]|[a-z][.)])\s+").expect("valid regex"));

pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_length: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_length: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            min_chunk_length,
        }
    }

    /// Split a parsed document (raw text per page) into normalized,
    /// deduplicated chunks. Chunks never cross page boundaries, so
    /// `page_number` stays meaningful.
    pub fn chunk_document(&self, pages: &[String]) -> ChunkOutcome {
        let mut chunks = Vec::new();
        let mut seen_hashes = std::collections::HashSet::new();
        let mut duplicates_skipped = 0;

        for (page_idx, page) in pages.iter().enumerate() {
            for piece in self.split_page(page) {
                let chunk_type = classify_chunk(&piece);
                let normalized = normalize_text(&piece);

                if normalized.chars().count() < self.min_chunk_length {
                    continue;
                }

                let hash = content_hash(&normalized);
                if !seen_hashes.insert(hash.clone()) {
                    duplicates_skipped += 1;
                    continue;
                }

                let word_count = normalized.split_whitespace().count();
                chunks.push(DraftChunk {
                    text: normalized,
                    content_hash: hash,
                    page_number: page_idx + 1,
                    chunk_type,
                    word_count,
                });
            }
        }

        ChunkOutcome {
            chunks,
            duplicates_skipped,
        }
    }

    /// Raw text of one page into raw chunk candidates.
    fn split_page(&self, page: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();

        for paragraph in split_paragraphs(page) {
            if paragraph.chars().count() > self.chunk_size {
                // Oversized paragraph: flush what we have, then go one
                // level down to sentences
                flush(&mut current, &mut out);
                self.split_long_paragraph(&paragraph, &mut out);
                continue;
            }

            let would_be = current.chars().count() + paragraph.chars().count() + 1;
            if !current.is_empty() && would_be > self.chunk_size {
                flush(&mut current, &mut out);
            }

            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&paragraph);
        }

        flush(&mut current, &mut out);
        out
    }

    fn split_long_paragraph(&self, paragraph: &str, out: &mut Vec<String>) {
        let mut current = String::new();

        for sentence in split_sentences(paragraph) {
            if sentence.chars().count() > self.chunk_size {
                flush(&mut current, out);
                self.force_split(&sentence, out);
                continue;
            }

            let would_be = current.chars().count() + sentence.chars().count() + 1;
            if !current.is_empty() && would_be > self.chunk_size {
                flush(&mut current, out);
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
        }

        flush(&mut current, out);
    }

    /// Last resort: fixed windows of `chunk_size` characters with
    /// `chunk_overlap` of carry-over between consecutive windows.
    fn force_split(&self, text: &str, out: &mut Vec<String>) {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.chunk_overlap;
        let mut start = 0;

        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            out.push(chars[start..end].iter().collect());

            if end >= chars.len() {
                break;
            }
            start += step;
        }
    }
}

fn flush(current: &mut String, out: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    current.clear();
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }

    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    paragraphs
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);

        if matches!(ch, '.' | '!' | '?') {
            // Boundary only when followed by whitespace (or end), so
            // decimals and abbreviations like "3.14" stay intact
            match chars.peek() {
                Some(next) if next.is_whitespace() => {
                    sentences.push(current.trim().to_string());
                    current.clear();
                }
                None => {}
                _ => {}
            }
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences.retain(|s| !s.is_empty());
    sentences
}

/// Heuristic chunk classification on the raw (pre-normalization) text.
fn classify_chunk(raw: &str) -> ChunkType {
    let trimmed = raw.trim();
    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();

    // Table: high density of digits and column delimiters
    let total = trimmed.chars().count().max(1);
    let tabular = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '|' | '\t' | ';'))
        .count();
    if total >= 20 && (tabular as f32 / total as f32) > 0.3 {
        return ChunkType::Table;
    }

    // List: majority of lines start with a bullet or enumeration marker
    if lines.len() >= 2 {
        let marked = lines.iter().filter(|l| LIST_MARKER.is_match(l)).count();
        if marked * 2 >= lines.len() {
            return ChunkType::List;
        }
    }

    // Heading: single short line, mostly capitalized, no terminal period
    if lines.len() == 1 && trimmed.chars().count() < 80 && !trimmed.ends_with('.') {
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        if !words.is_empty() {
            let capitalized = words
                .iter()
                .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
                .count();
            if capitalized * 3 >= words.len() * 2 {
                return ChunkType::Heading;
            }
        }
    }

    ChunkType::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> TextChunker {
        TextChunker::new(200, 40, 10)
    }

    #[test]
    fn test_paragraphs_kept_together() {
        let page = "First paragraph with enough words to pass the minimum.\n\n\
                    Second paragraph, also long enough to be kept around."
            .to_string();
        let outcome = chunker().chunk_document(&[page]);

        assert_eq!(outcome.chunks.len(), 1);
        assert!(outcome.chunks[0].text.contains("First paragraph"));
        assert!(outcome.chunks[0].text.contains("Second paragraph"));
    }

    #[test]
    fn test_oversized_paragraph_splits_on_sentences() {
        let page: String = (0..8)
            .map(|i| format!("Sentence number {i} keeps growing this paragraph past the limit. "))
            .collect();
        let outcome = TextChunker::new(150, 20, 10).chunk_document(&[page]);

        assert!(outcome.chunks.len() > 1);
        for chunk in &outcome.chunks {
            assert!(chunk.text.chars().count() <= 150);
        }
    }

    #[test]
    fn test_forced_split_of_unbroken_text() {
        // One unbroken "sentence" far beyond the chunk size: 6 windows of
        // identical characters, of which dedup keeps exactly one
        let page = "x".repeat(500);
        let outcome = TextChunker::new(100, 20, 10).chunk_document(&[page]);

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.duplicates_skipped, 5);
    }

    #[test]
    fn test_forced_split_window_step() {
        let text: String = ('a'..='z').cycle().take(250).collect();
        let mut out = Vec::new();
        TextChunker::new(100, 20, 10).force_split(&text, &mut out);

        assert_eq!(out[0].chars().count(), 100);
        // Consecutive windows share the configured overlap
        let first_tail: String = out[0].chars().skip(80).collect();
        let second_head: String = out[1].chars().take(20).collect();
        assert_eq!(first_tail, second_head);
    }

    #[test]
    fn test_min_chunk_length_rejection() {
        let page = "Tiny.\n\nAlso small.".to_string();
        let outcome = TextChunker::new(200, 40, 50).chunk_document(&[page]);
        assert!(outcome.chunks.is_empty());
    }

    #[test]
    fn test_local_dedup() {
        let paragraph = "The refund policy allows returns within thirty days of purchase.";
        let page = format!("{p}\n\n{p}\n\n{p}", p = paragraph);
        // Small chunk size so each paragraph becomes its own chunk
        let outcome = TextChunker::new(70, 10, 10).chunk_document(&[page]);

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.duplicates_skipped, 2);
    }

    #[test]
    fn test_dedup_across_pages() {
        let para = "Shared boilerplate footer repeated on every single page.".to_string();
        let outcome = TextChunker::new(200, 40, 10).chunk_document(&[para.clone(), para]);

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.duplicates_skipped, 1);
        assert_eq!(outcome.chunks[0].page_number, 1);
    }

    #[test]
    fn test_empty_document() {
        let outcome = chunker().chunk_document(&[String::new(), "   \n\n ".to_string()]);
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.duplicates_skipped, 0);
    }

    #[test]
    fn test_classify_heading() {
        assert_eq!(
            classify_chunk("Chapter Three: Financial Aid Overview"),
            ChunkType::Heading
        );
    }

    #[test]
    fn test_classify_list() {
        let list = "- submit the application form\n- attach two references\n- pay the fee";
        assert_eq!(classify_chunk(list), ChunkType::List);
    }

    #[test]
    fn test_classify_table() {
        let table = "2021 | 1500 | 320\n2022 | 1750 | 410\n2023 | 1900 | 515";
        assert_eq!(classify_chunk(table), ChunkType::Table);
    }

    #[test]
    fn test_classify_prose() {
        let prose = "applications are reviewed by the committee on a rolling basis \
                     and decisions are mailed within six weeks.";
        assert_eq!(classify_chunk(prose), ChunkType::Text);
    }

    #[test]
    fn test_word_count_and_hash_populated() {
        let page = "The scholarship deadline is March 15, 2025 for all applicants.".to_string();
        let outcome = chunker().chunk_document(&[page]);

        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.word_count, 10);
        assert_eq!(chunk.content_hash.len(), 64);
        assert_eq!(chunk.page_number, 1);
    }
}
