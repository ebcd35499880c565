use anyhow::{Context, Result};
use lopdf::Document;

#[derive(Debug)]
pub struct ParsedPdf {
    /// Raw extracted text, one entry per page, in page order
    pub pages: Vec<String>,
    pub page_count: usize,
}

pub struct PdfParser;

impl PdfParser {
    /// Extract text page by page from in-memory PDF bytes.
    pub fn extract_pages(bytes: &[u8]) -> Result<ParsedPdf> {
        let doc = Document::load_mem(bytes).context("Failed to load PDF document")?;
        let page_count = doc.get_pages().len();

        let mut pages = Vec::with_capacity(page_count);
        for page_num in 1..=page_count {
            match doc.extract_text(&[page_num as u32]) {
                Ok(text) => pages.push(text),
                Err(e) => {
                    // A single unextractable page (scanned image, broken
                    // stream) should not sink the document
                    tracing::warn!("Failed to extract text from page {}: {}", page_num, e);
                    pages.push(String::new());
                }
            }
        }

        Ok(ParsedPdf { pages, page_count })
    }
}
