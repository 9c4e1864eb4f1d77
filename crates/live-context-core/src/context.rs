//! Assembles ranked retrieval results into a bounded context payload.
//!
//! Results are grouped per document. Within a document only the newest
//! version is kept, and the run of consecutive chunk indices around the
//! best-scoring chunk is merged into one section so the consumer reads
//! continuous text. Sections are rendered best-first with source
//! attribution, and rendering stops once the token budget is spent.
//!
//! # Output format
//!
//! ````text
//! Here are the most relevant snippets from the LIVE codebase:
//!
//! FILE #1: src/lib.rs (chunks 0-1, lines 1-40, relevance 0.812)
//! ```
//! <chunk text>
//! ```
//! ````

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use crate::models::{LineRange, RetrievalResult, SourceType, Version};

/// First line of every non-empty payload.
pub const PREAMBLE: &str = "Here are the most relevant snippets from the LIVE codebase:";

const FENCE: &str = "```";

/// One attributed block of the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSection {
    pub path: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub version: Version,
    pub chunk_start: u32,
    pub chunk_end: u32,
    pub lines: LineRange,
    pub score: f32,
    pub text: String,
}

/// The assembled, budget-limited context handed to the reasoning consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    pub text: String,
    pub sections: Vec<ContextSection>,
    pub token_estimate: usize,
    /// True when at least one section was cut or left out for budget.
    pub truncated: bool,
}

/// Build a payload from `results` that fits in `token_budget` tokens.
///
/// Deterministic for identical inputs.
pub fn build(results: &[RetrievalResult], token_budget: usize) -> ContextPayload {
    let sections = collect_sections(results);
    if sections.is_empty() {
        return ContextPayload::default();
    }

    let mut out = Renderer::new(token_budget);
    if !out.push(&format!("{}\n\n", PREAMBLE)) {
        return ContextPayload {
            truncated: true,
            ..ContextPayload::default()
        };
    }

    let mut kept = Vec::with_capacity(sections.len());
    let mut truncated = false;

    for (i, mut section) in sections.into_iter().enumerate() {
        let header = format!(
            "FILE #{}: {} (chunks {}-{}, lines {}-{}, relevance {:.3})\n{}\n",
            i + 1,
            section.path,
            section.chunk_start,
            section.chunk_end,
            section.lines.start,
            section.lines.end,
            section.score,
            FENCE
        );
        let body = section.text.trim_end_matches('\n');
        let footer = format!("\n{}\n\n", FENCE);

        let frame = estimate_tokens(&header) + estimate_tokens(&footer);
        let needed = frame + estimate_tokens(body);

        if needed <= out.remaining() {
            out.push(&header);
            out.push(body);
            out.push(&footer);
            kept.push(section);
            continue;
        }

        truncated = true;
        let room = out.remaining().saturating_sub(frame);
        if room > 0 {
            let cut = cut_to_chars(body, room * CHARS_PER_TOKEN);
            if !cut.trim().is_empty() {
                out.push(&header);
                out.push(cut);
                out.push(&footer);
                section.text = cut.to_string();
                kept.push(section);
            }
        }
        break;
    }

    let text = out.finish();
    ContextPayload {
        token_estimate: estimate_tokens(&text),
        text,
        sections: kept,
        truncated,
    }
}

/// Accumulates rendered parts while tracking the summed token estimate.
///
/// `ceil` is subadditive, so the estimate of the joined text never exceeds
/// the sum of the parts' estimates.
struct Renderer {
    text: String,
    used: usize,
    budget: usize,
}

impl Renderer {
    fn new(budget: usize) -> Self {
        Self {
            text: String::new(),
            used: 0,
            budget,
        }
    }

    fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }

    fn push(&mut self, part: &str) -> bool {
        let cost = estimate_tokens(part);
        if cost > self.remaining() {
            return false;
        }
        self.used += cost;
        self.text.push_str(part);
        true
    }

    fn finish(self) -> String {
        self.text.trim_end().to_string()
    }
}

/// Group results per document and merge each group into one section.
fn collect_sections(results: &[RetrievalResult]) -> Vec<ContextSection> {
    let mut groups: BTreeMap<(&str, &str), Vec<&RetrievalResult>> = BTreeMap::new();
    for r in results {
        groups
            .entry((r.metadata.source_id.as_str(), r.metadata.path.as_str()))
            .or_default()
            .push(r);
    }

    let mut sections: Vec<ContextSection> = groups.into_values().filter_map(merge_group).collect();

    sections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
    sections
}

fn merge_group(mut group: Vec<&RetrievalResult>) -> Option<ContextSection> {
    let version = group.iter().map(|r| r.metadata.version).max()?;
    group.retain(|r| r.metadata.version == version);
    group.sort_by_key(|r| r.metadata.chunk_index);
    group.dedup_by_key(|r| r.metadata.chunk_index);

    let best = group
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| ib.cmp(ia))
        })
        .map(|(i, _)| i)?;

    let mut lo = best;
    while lo > 0 && group[lo - 1].metadata.chunk_index + 1 == group[lo].metadata.chunk_index {
        lo -= 1;
    }
    let mut hi = best;
    while hi + 1 < group.len()
        && group[hi].metadata.chunk_index + 1 == group[hi + 1].metadata.chunk_index
    {
        hi += 1;
    }

    let run = &group[lo..=hi];
    let first = &run[0].metadata;
    let last = &run[run.len() - 1].metadata;
    Some(ContextSection {
        path: first.path.clone(),
        source_id: first.source_id.clone(),
        source_type: first.source_type,
        version,
        chunk_start: first.chunk_index,
        chunk_end: last.chunk_index,
        lines: LineRange {
            start: first.lines.start,
            end: last.lines.end,
        },
        score: group[best].score,
        text: run.iter().map(|r| r.metadata.text.as_str()).collect(),
    })
}

/// Longest prefix of `text` with at most `max_chars` chars, ending on a line
/// boundary when one exists.
fn cut_to_chars(text: &str, max_chars: usize) -> &str {
    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let prefix = &text[..end];
    if end == text.len() {
        return prefix;
    }
    match prefix.rfind('\n') {
        Some(nl) if nl > 0 => &prefix[..nl],
        _ => prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryMetadata;

    fn hit(path: &str, chunk_index: u32, version: Version, score: f32, text: &str) -> RetrievalResult {
        let line = chunk_index * 10 + 1;
        RetrievalResult {
            chunk_id: format!("local:{}@{}#{}", path, version, chunk_index),
            score,
            metadata: EntryMetadata {
                source_id: "local".to_string(),
                path: path.to_string(),
                source_type: SourceType::Local,
                chunk_index,
                lines: LineRange {
                    start: line,
                    end: line + 9,
                },
                version,
                token_count: estimate_tokens(text),
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn test_empty_results_give_empty_payload() {
        let payload = build(&[], 100);
        assert_eq!(payload, ContextPayload::default());
    }

    #[test]
    fn test_format_and_attribution() {
        let payload = build(&[hit("a.py", 0, 2, 0.9, "def f(): return 1\n")], 1000);
        assert!(payload.text.starts_with(PREAMBLE));
        assert!(payload
            .text
            .contains("FILE #1: a.py (chunks 0-0, lines 1-10, relevance 0.900)\n```\ndef f(): return 1\n```"));
        assert!(!payload.truncated);
        assert_eq!(payload.sections.len(), 1);
        assert_eq!(payload.token_estimate, estimate_tokens(&payload.text));
    }

    #[test]
    fn test_dedup_keeps_best_and_merges_adjacent() {
        let results = vec![
            hit("a.py", 3, 1, 0.95, "three\n"),
            hit("b.py", 0, 1, 0.80, "bee\n"),
            hit("a.py", 4, 1, 0.50, "four\n"),
            hit("a.py", 2, 1, 0.40, "two\n"),
            hit("a.py", 7, 1, 0.90, "seven\n"),
        ];
        let payload = build(&results, 10_000);
        assert_eq!(payload.sections.len(), 2);

        let a = &payload.sections[0];
        assert_eq!(a.path, "a.py");
        assert_eq!((a.chunk_start, a.chunk_end), (2, 4));
        assert_eq!(a.text, "two\nthree\nfour\n");
        assert_eq!(a.lines, LineRange { start: 21, end: 50 });
        assert_eq!(a.score, 0.95);
        assert!(!payload.text.contains("seven"));

        assert_eq!(payload.sections[1].path, "b.py");
    }

    #[test]
    fn test_older_versions_dropped() {
        let results = vec![
            hit("a.py", 0, 1, 0.99, "def f(): pass\n"),
            hit("a.py", 0, 2, 0.70, "def f(): return 1\n"),
        ];
        let payload = build(&results, 1000);
        assert_eq!(payload.sections.len(), 1);
        assert_eq!(payload.sections[0].version, 2);
        assert!(!payload.text.contains("pass"));
    }

    #[test]
    fn test_budget_never_exceeded() {
        let results: Vec<_> = (0..10)
            .map(|i| {
                let body = format!("fn item_{}() {{ body }}\n", i).repeat(8);
                hit(&format!("f{}.rs", i), 0, 1, 1.0 - i as f32 * 0.05, &body)
            })
            .collect();
        let unbounded = build(&results, usize::MAX);
        assert!(!unbounded.truncated);

        for budget in [0usize, 5, 15, 40, 120, 400, 1000] {
            let payload = build(&results, budget);
            assert!(
                payload.token_estimate <= budget,
                "budget {} produced {} tokens",
                budget,
                payload.token_estimate
            );
            assert!(unbounded.text.len() >= payload.text.len());
        }
    }

    #[test]
    fn test_truncation_cuts_last_section_on_line_boundary() {
        let long = (0..50).map(|i| format!("line {}\n", i)).collect::<String>();
        let payload = build(&[hit("a.py", 0, 1, 0.9, &long)], 80);
        assert!(payload.truncated);
        assert_eq!(payload.sections.len(), 1);
        assert!(payload.sections[0].text.len() < long.len());
        assert!(payload.sections[0].text.ends_with(|c: char| c.is_ascii_digit()));
        assert!(payload.text.ends_with(FENCE));
    }

    #[test]
    fn test_deterministic() {
        let results = vec![
            hit("b.py", 0, 1, 0.5, "same\n"),
            hit("a.py", 0, 1, 0.5, "same\n"),
        ];
        let p1 = build(&results, 200);
        let p2 = build(&results, 200);
        assert_eq!(p1, p2);
        assert_eq!(p1.sections[0].path, "a.py");
    }
}
