use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::types::Chunk;
use super::StorageError;

/// Bracketed placeholder tokens; chunk ends avoid splitting these.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[A-Z][A-Z0-9_-]*\]").expect("valid regex"));

/// Sliding-window chunker over scrubbed text.
///
/// Sizes are in characters. Each window ends at the last paragraph break,
/// then sentence end, then whitespace found in the second half of the
/// window; failing all three it cuts at `max_size`. The next window starts
/// `overlap` characters before the previous end.
#[derive(Debug, Clone, Copy)]
pub struct TextChunker {
    max_size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(max_size: usize, overlap: usize) -> Result<Self, StorageError> {
        if max_size == 0 {
            return Err(StorageError::InvalidChunking("max_size must be positive".into()));
        }
        if overlap >= max_size {
            return Err(StorageError::InvalidChunking(format!(
                "overlap ({overlap}) must be smaller than max_size ({max_size})"
            )));
        }
        Ok(Self { max_size, overlap })
    }

    pub fn chunk(&self, text: &str, document_id: Uuid, source_label: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        if n == 0 {
            return Vec::new();
        }
        let protected = placeholder_char_spans(text);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut prev_end = 0;
        loop {
            let hard_end = (start + self.max_size).min(n);
            let end = if hard_end == n {
                n
            } else {
                self.find_cut(&chars, start, hard_end, &protected)
            };

            let order = chunks.len();
            chunks.push(Chunk {
                id: Chunk::derive_id(&document_id, order),
                document_id,
                text: chars[start..end].iter().collect(),
                start_offset: start,
                end_offset: end,
                source_label: source_label.to_string(),
                order,
                overlap_with_previous: if order == 0 { 0 } else { prev_end - start },
            });

            if end == n {
                break;
            }
            prev_end = end;
            start = end.saturating_sub(self.overlap).max(start + 1);
        }

        tracing::debug!(
            document_id = %document_id,
            chunks = chunks.len(),
            chars = n,
            "Document chunked"
        );
        chunks
    }

    fn find_cut(&self, chars: &[char], start: usize, hard_end: usize, protected: &[(usize, usize)]) -> usize {
        let min_cut = start + (self.max_size / 2).max(1);
        let inside = |p: usize| protected.iter().any(|&(s, e)| s < p && p < e);

        let preferences: [&dyn Fn(usize) -> bool; 3] = [
            &|p: usize| p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n',
            &|p: usize| p >= 2 && chars[p - 1].is_whitespace() && matches!(chars[p - 2], '.' | '!' | '?'),
            &|p: usize| chars[p - 1].is_whitespace(),
        ];
        for is_boundary in preferences {
            let found = (min_cut..=hard_end).rev().find(|&p| p > start && is_boundary(p) && !inside(p));
            if let Some(p) = found {
                return p;
            }
        }

        // Hard cut; back off to the start of a straddled placeholder if that
        // still leaves a non-empty chunk.
        match protected.iter().find(|&&(s, e)| s < hard_end && hard_end < e) {
            Some(&(s, _)) if s > start => s,
            _ => hard_end,
        }
    }
}

/// Split `text` into chunks with the given window and overlap.
pub fn chunk(
    text: &str,
    document_id: Uuid,
    source_label: &str,
    max_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, StorageError> {
    Ok(TextChunker::new(max_size, overlap)?.chunk(text, document_id, source_label))
}

/// Rebuild the source text from consecutive chunks of one document.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.extend(c.text.chars().skip(c.overlap_with_previous));
    }
    out
}

/// Placeholder token spans in character offsets.
fn placeholder_char_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut byte_to_char = text.char_indices().map(|(b, _)| b).enumerate().peekable();
    for m in PLACEHOLDER_RE.find_iter(text) {
        let mut start = None;
        let mut end = None;
        while let Some(&(ci, b)) = byte_to_char.peek() {
            if b == m.start() {
                start = Some(ci);
            }
            if b == m.end() {
                end = Some(ci);
                break;
            }
            byte_to_char.next();
        }
        match (start, end) {
            (Some(s), Some(e)) => spans.push((s, e)),
            (Some(s), None) => spans.push((s, text.chars().count())),
            _ => {}
        }
    }
    spans
}
