pub mod chunker;
pub mod parser;

pub use chunker::{ChunkOutcome, ChunkType, DraftChunk, TextChunker};
pub use parser::{ParsedPdf, PdfParser};
