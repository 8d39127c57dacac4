// Static audit over every source file: tracing calls must never carry raw
// clinical text, identifier values, or anything derived from them.

use std::fs;
use std::path::Path;

/// Field names and interpolations that would put patient text into a log line.
const PHI_PATTERNS: &[&str] = &[
    // Raw or scrubbed document text
    "original_text",
    "scrubbed_text",
    "raw_text",
    "doc.text",
    "document.text",
    "chunk.text",
    "%text",
    "?text",
    // Labels and free-text requests
    "source_label",
    "request.query",
    "%query",
    "?query",
    "focus.text",
    // Identifier values and the reversible map
    "entity.value",
    "span.value",
    "detected.value",
    "redaction_map",
    "entries",
    // Prompt and model output bodies
    "user_message",
    "system_prompt",
    "report.content",
    "%content",
    "?content",
    "%output",
    "?output",
];

const ALLOWLIST: &[&str] = &["phi_audit.rs"];

const TRACING_MACROS: &[&str] = &[
    "tracing::info!",
    "tracing::warn!",
    "tracing::error!",
    "tracing::debug!",
    "tracing::trace!",
];

type Violation = (String, usize, String, String);

#[test]
fn no_phi_in_tracing_calls() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    assert!(src_dir.exists(), "Source directory not found: {}", src_dir.display());

    let mut violations = Vec::new();
    scan_directory(&src_dir, &src_dir, &mut violations);

    if !violations.is_empty() {
        let report = violations
            .iter()
            .map(|(file, line_num, call, pattern)| format!("  {file}:{line_num}: found '{pattern}' in: {call}"))
            .collect::<Vec<_>>()
            .join("\n");
        panic!(
            "PHI audit failed, {} violation(s) in tracing calls:\n{}\n\n\
             Log counts, kinds and opaque IDs instead.",
            violations.len(),
            report
        );
    }
}

#[test]
fn phi_patterns_list_is_not_empty() {
    assert!(PHI_PATTERNS.len() >= 10);
}

#[test]
fn scanner_detects_known_violation() {
    let calls = collect_tracing_calls(
        "fn f() {\n    tracing::info!(\n        label = %doc.source_label,\n        \"ingested\"\n    );\n}\n",
    );
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, 2);
    assert!(matching_patterns(&calls[0].1).contains(&"source_label"));
}

#[test]
fn scanner_passes_clean_tracing() {
    let calls = collect_tracing_calls(
        "tracing::info!(document_id = %doc.id, chunks = count, \"Document ingested\");\n\
         tracing::debug!(output_chars = n, \"Generation complete\");",
    );
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, call)| matching_patterns(call).is_empty()));
}

#[test]
fn non_tracing_lines_are_ignored() {
    let calls = collect_tracing_calls("let scrubbed_text = result.scrubbed_text;\nprintln!(\"{}\", doc.text);");
    assert!(calls.is_empty());
}

fn matching_patterns(call: &str) -> Vec<&'static str> {
    PHI_PATTERNS.iter().copied().filter(|p| call.contains(p)).collect()
}

/// Returns (1-indexed start line, joined call text) for each tracing macro.
fn collect_tracing_calls(content: &str) -> Vec<(usize, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut calls = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        let Some(start) = TRACING_MACROS.iter().filter_map(|m| trimmed.find(m)).min() else {
            i += 1;
            continue;
        };

        let mut call = String::from(&trimmed[start..]);
        let mut depth = paren_depth(&call);
        let mut j = i + 1;
        while depth > 0 && j < lines.len() {
            let next = lines[j].trim();
            call.push(' ');
            call.push_str(next);
            depth += paren_depth(next);
            j += 1;
        }
        calls.push((i + 1, call));
        i = j;
    }
    calls
}

fn paren_depth(s: &str) -> i32 {
    s.chars().fold(0, |d, ch| match ch {
        '(' => d + 1,
        ')' => d - 1,
        _ => d,
    })
}

fn scan_directory(root: &Path, dir: &Path, violations: &mut Vec<Violation>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_directory(root, &path, violations);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            scan_file(root, &path, violations);
        }
    }
}

fn scan_file(root: &Path, path: &Path, violations: &mut Vec<Violation>) {
    let filename = path.file_name().unwrap_or_default().to_string_lossy();
    if ALLOWLIST.iter().any(|a| filename.contains(a)) {
        return;
    }
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    let relative = path.strip_prefix(root).unwrap_or(path).display().to_string();

    for (line, call) in collect_tracing_calls(&content) {
        for pattern in matching_patterns(&call) {
            violations.push((relative.clone(), line, call.clone(), pattern.to_string()));
        }
    }
}
