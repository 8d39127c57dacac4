use super::types::AssembledContext;
use crate::pipeline::storage::ScoredChunk;

const SEPARATOR: &str = "\n\n---\n\n";

fn format_chunk(position: usize, chunk: &ScoredChunk) -> String {
    format!("[Source {position}: {}]\n{}", chunk.chunk.source_label, chunk.chunk.text.trim())
}

/// Enumerate retrieved chunks, in rank order, within `budget_chars`.
///
/// A chunk that would overflow the budget is skipped; later, shorter chunks
/// may still fit. Source numbers are assigned to included chunks only.
pub fn assemble_context(chunks: &[ScoredChunk], budget_chars: usize) -> AssembledContext {
    let mut sections: Vec<String> = Vec::new();
    let mut total_chars = 0;

    for chunk in chunks {
        if total_chars >= budget_chars {
            break;
        }
        let section = format_chunk(sections.len() + 1, chunk);
        let cost = section.chars().count() + if sections.is_empty() { 0 } else { SEPARATOR.len() };
        if total_chars + cost <= budget_chars {
            total_chars += cost;
            sections.push(section);
        }
    }

    if sections.len() < chunks.len() {
        tracing::debug!(
            included = sections.len(),
            retrieved = chunks.len(),
            budget_chars,
            "Context budget reached"
        );
    }

    AssembledContext {
        chunks_included: sections.len(),
        text: sections.join(SEPARATOR),
        chars_used: total_chars,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::storage::Chunk;
    use uuid::Uuid;

    fn scored(label: &str, text: &str, score: f32) -> ScoredChunk {
        let doc = Uuid::new_v4();
        ScoredChunk {
            chunk: Chunk {
                id: Chunk::derive_id(&doc, 0),
                document_id: doc,
                text: text.to_string(),
                start_offset: 0,
                end_offset: text.chars().count(),
                source_label: label.to_string(),
                order: 0,
                overlap_with_previous: 0,
            },
            score,
        }
    }

    #[test]
    fn enumerates_chunks_with_labels() {
        let ctx = assemble_context(
            &[scored("Admission note", "Admitted [PHI-DATE].", 0.9), scored("Progress note", "Stable.", 0.8)],
            4000,
        );
        assert_eq!(ctx.chunks_included, 2);
        assert_eq!(
            ctx.text,
            "[Source 1: Admission note]\nAdmitted [PHI-DATE].\n\n---\n\n[Source 2: Progress note]\nStable."
        );
        assert_eq!(ctx.chars_used, ctx.text.chars().count());
    }

    #[test]
    fn respects_budget_and_skips_oversized() {
        let big = "x".repeat(500);
        let ctx = assemble_context(
            &[scored("a", "short one", 0.9), scored("b", &big, 0.8), scored("c", "short two", 0.7)],
            100,
        );
        assert_eq!(ctx.chunks_included, 2);
        assert!(ctx.text.contains("[Source 2: c]"));
        assert!(!ctx.text.contains(&big));
        assert!(ctx.chars_used <= 100);
    }

    #[test]
    fn empty_input_is_empty_context() {
        let ctx = assemble_context(&[], 4000);
        assert!(ctx.text.is_empty());
        assert_eq!(ctx.chunks_included, 0);
    }
}
