//! Semantic chunking for code and documentation.
//!
//! Splits at logical boundaries (top-level definitions, markdown headings,
//! paragraph breaks) chosen by file extension, so retrieval units stay
//! coherent. Every emitted chunk is trimmed, non-empty, and bounded by
//! `min_chunk_size ..= max_chunk_size`; oversized logical units fall back
//! to windowed character splits with overlap.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Metadata, MetadataValue};

static PYTHON_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(def |class |async def )").unwrap());
static JS_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(function |class |const \w+ = |export |import )").unwrap());
static BRACE_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+.*\{|func |fn |pub )").unwrap());
static GENERIC_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+.*\{").unwrap());
static MARKDOWN_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s+").unwrap());

/// Number of trailing lines carried into the next code chunk.
const CODE_OVERLAP_LINES: usize = 3;

/// Label describing how a chunk was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Code split at a definition boundary
    CodeBlock,
    /// Oversized code unit split by character window
    CodeSplit,
    /// Markdown section under one heading
    MarkdownSection,
    /// Oversized markdown section split by character window
    MarkdownSplit,
    /// Paragraph-grouped prose
    TextBlock,
}

impl ChunkKind {
    /// The `type` metadata label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ChunkKind::CodeBlock => "code_block",
            ChunkKind::CodeSplit => "code_split",
            ChunkKind::MarkdownSection => "markdown_section",
            ChunkKind::MarkdownSplit => "markdown_split",
            ChunkKind::TextBlock => "text_block",
        }
    }

    fn split_variant(self) -> Self {
        match self {
            ChunkKind::CodeBlock | ChunkKind::CodeSplit => ChunkKind::CodeSplit,
            ChunkKind::MarkdownSection | ChunkKind::MarkdownSplit => ChunkKind::MarkdownSplit,
            ChunkKind::TextBlock => ChunkKind::TextBlock,
        }
    }
}

/// A semantically coherent chunk of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticChunk {
    /// Trimmed chunk text
    pub content: String,
    /// 1-based first line
    pub start_line: usize,
    /// 1-based last line (inclusive)
    pub end_line: usize,
    /// Production label
    pub kind: ChunkKind,
}

impl SemanticChunk {
    /// Chunker-owned metadata keys for this chunk.
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("start_line".to_string(), MetadataValue::Int(self.start_line as i64));
        metadata.insert("end_line".to_string(), MetadataValue::Int(self.end_line as i64));
        metadata.insert("type".to_string(), self.kind.label().into());
        metadata
    }
}

enum Strategy {
    Code(&'static Regex),
    Markdown,
    Text,
}

fn strategy_for(file_path: &str) -> Strategy {
    let ext = file_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => Strategy::Code(&PYTHON_BOUNDARY),
        "js" | "ts" | "jsx" | "tsx" => Strategy::Code(&JS_BOUNDARY),
        "go" | "rs" | "c" | "cpp" | "h" | "hpp" | "java" | "cs" | "swift" | "kt" | "scala" => {
            Strategy::Code(&BRACE_BOUNDARY)
        }
        "md" | "markdown" => Strategy::Markdown,
        "php" | "rb" | "sh" | "sql" => Strategy::Code(&GENERIC_BOUNDARY),
        _ => Strategy::Text,
    }
}

/// Chunks documents at semantic boundaries.
#[derive(Debug, Clone)]
pub struct SemanticChunker {
    min_chunk_size: usize,
    max_chunk_size: usize,
    chunk_overlap: usize,
}

impl SemanticChunker {
    /// Create a chunker with the given bounds.
    #[must_use]
    pub fn new(min_chunk_size: usize, max_chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            min_chunk_size,
            max_chunk_size: max_chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(max_chunk_size.saturating_sub(1)),
        }
    }

    /// Apply the extension-appropriate strategy to one file.
    #[must_use]
    pub fn chunk_file(&self, content: &str, file_path: &str) -> Vec<SemanticChunk> {
        let raw = match strategy_for(file_path) {
            Strategy::Code(boundary) => self.chunk_lines(content, boundary, ChunkKind::CodeBlock, true),
            Strategy::Markdown => {
                self.chunk_lines(content, &MARKDOWN_HEADING, ChunkKind::MarkdownSection, false)
            }
            Strategy::Text => self.chunk_text(content),
        };
        self.enforce_bounds(raw)
    }

    /// Boundary-driven accumulation over lines, shared by code and markdown.
    fn chunk_lines(
        &self,
        content: &str,
        boundary: &Regex,
        kind: ChunkKind,
        overlap_lines: bool,
    ) -> Vec<SemanticChunk> {
        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();
        let mut buffer: Vec<&str> = Vec::new();
        let mut buffer_start = 1usize;

        for (i, line) in lines.iter().enumerate() {
            let line_no = i + 1;
            let at_boundary = boundary.is_match(line.trim_start());

            if at_boundary && !buffer.is_empty() {
                let text = buffer.join("\n");
                if text.trim().len() >= self.min_chunk_size {
                    chunks.push(SemanticChunk {
                        content: text.trim().to_string(),
                        start_line: buffer_start,
                        end_line: line_no - 1,
                        kind,
                    });
                    if overlap_lines {
                        let carry = buffer.len().min(CODE_OVERLAP_LINES);
                        buffer = buffer[buffer.len() - carry..].to_vec();
                        buffer_start = line_no - carry;
                    } else {
                        buffer = Vec::new();
                        buffer_start = line_no;
                    }
                }
            }

            buffer.push(line);

            // Oversized accumulation flushes regardless of boundaries; the
            // bounds pass window-splits it further if still too large.
            if buffer.iter().map(|l| l.len() + 1).sum::<usize>() > self.max_chunk_size {
                let text = buffer.join("\n");
                chunks.push(SemanticChunk {
                    content: text.trim().to_string(),
                    start_line: buffer_start,
                    end_line: line_no,
                    kind: kind.split_variant(),
                });
                buffer = Vec::new();
                buffer_start = line_no + 1;
            }
        }

        if !buffer.is_empty() {
            let text = buffer.join("\n");
            if !text.trim().is_empty() {
                chunks.push(SemanticChunk {
                    content: text.trim().to_string(),
                    start_line: buffer_start,
                    end_line: lines.len(),
                    kind,
                });
            }
        }

        chunks
    }

    /// Paragraph-grouped chunking for plain text.
    fn chunk_text(&self, content: &str) -> Vec<SemanticChunk> {
        let mut paragraphs: Vec<(usize, usize, String)> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut start = 1usize;
        let mut line_no = 0usize;

        for line in content.lines() {
            line_no += 1;
            if line.trim().is_empty() {
                if !current.is_empty() {
                    paragraphs.push((start, line_no - 1, current.join("\n")));
                    current = Vec::new();
                }
                start = line_no + 1;
            } else {
                if current.is_empty() {
                    start = line_no;
                }
                current.push(line);
            }
        }
        if !current.is_empty() {
            paragraphs.push((start, line_no, current.join("\n")));
        }

        let mut chunks = Vec::new();
        let mut buffer = String::new();
        let mut buffer_range = (0usize, 0usize);

        for (para_start, para_end, text) in paragraphs {
            if !buffer.is_empty() && buffer.len() + text.len() + 2 > self.max_chunk_size {
                chunks.push(SemanticChunk {
                    content: buffer.trim().to_string(),
                    start_line: buffer_range.0,
                    end_line: buffer_range.1,
                    kind: ChunkKind::TextBlock,
                });
                buffer = String::new();
            }
            if buffer.is_empty() {
                buffer_range.0 = para_start;
            } else {
                buffer.push_str("\n\n");
            }
            buffer.push_str(&text);
            buffer_range.1 = para_end;
        }
        if !buffer.trim().is_empty() {
            chunks.push(SemanticChunk {
                content: buffer.trim().to_string(),
                start_line: buffer_range.0,
                end_line: buffer_range.1,
                kind: ChunkKind::TextBlock,
            });
        }

        chunks
    }

    /// Enforce `min ..= max` on every chunk: window-split oversized chunks
    /// with character overlap, merge an undersized chunk into its
    /// predecessor when the merge stays within bounds, and drop unmergable
    /// fragments.
    fn enforce_bounds(&self, raw: Vec<SemanticChunk>) -> Vec<SemanticChunk> {
        let mut bounded: Vec<SemanticChunk> = Vec::new();

        for chunk in raw {
            if chunk.content.is_empty() {
                continue;
            }
            if chunk.content.len() > self.max_chunk_size {
                bounded.extend(self.window_split(&chunk));
                continue;
            }
            if chunk.content.len() < self.min_chunk_size {
                if let Some(previous) = bounded.last_mut() {
                    if previous.content.len() + chunk.content.len() + 1 <= self.max_chunk_size {
                        previous.content.push('\n');
                        previous.content.push_str(&chunk.content);
                        previous.end_line = previous.end_line.max(chunk.end_line);
                        continue;
                    }
                }
                // A short lone fragment with nothing to merge into is noise.
                continue;
            }
            bounded.push(chunk);
        }

        bounded
    }

    fn window_split(&self, chunk: &SemanticChunk) -> Vec<SemanticChunk> {
        let step = self.max_chunk_size - self.chunk_overlap;
        let bytes = chunk.content.as_bytes();
        let mut pieces = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let tentative_end = (offset + self.max_chunk_size).min(bytes.len());
            // Back off to a char boundary so the slice stays valid UTF-8.
            let end = floor_char_boundary(&chunk.content, tentative_end);
            let piece = chunk.content[floor_char_boundary(&chunk.content, offset)..end].trim();
            if piece.len() >= self.min_chunk_size {
                pieces.push(SemanticChunk {
                    content: piece.to_string(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    kind: chunk.kind.split_variant(),
                });
            }
            if end == bytes.len() {
                break;
            }
            offset += step;
        }

        pieces
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
