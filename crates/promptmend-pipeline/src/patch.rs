//! Applies proposed modifications to prompt text.
//!
//! The quoted original text rarely matches byte for byte once earlier edits
//! in the same batch have landed, so location falls back from an exact
//! search to a fuzzy one over word-aligned windows scored with `similar`.

use promptmend_core::{Modification, PromptMendError};
use similar::TextDiff;
use std::collections::HashSet;
use std::ops::Range;

/// Default minimum similarity for a fuzzy location
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.75;

/// Windows scored with the character diff after the word-overlap prefilter
const SCORED_CANDIDATES: usize = 5;

/// A modification that could not be located
#[derive(Debug, Clone, PartialEq)]
pub struct PatchFailure {
    pub index: usize,
    pub reason: String,
    pub best_similarity: f32,
}

impl From<PatchFailure> for PromptMendError {
    fn from(failure: PatchFailure) -> Self {
        PromptMendError::PatchApplication {
            index: failure.index,
            reason: failure.reason,
        }
    }
}

/// Where and how confidently one modification landed
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub text: String,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    threshold: f32,
}

impl Default for PatchEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl PatchEngine {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Apply one modification to `text`, returning the new text. `index` only
    /// labels the failure.
    pub fn apply(
        &self,
        text: &str,
        modification: &Modification,
        index: usize,
    ) -> Result<PatchOutcome, PatchFailure> {
        let section = section_range(text, &modification.locator);
        let section_matched = section.is_some();
        let scope = section.unwrap_or(0..text.len());
        let needle = modification.original_text.trim();

        if needle.is_empty() {
            return Ok(PatchOutcome {
                text: insert(text, scope, section_matched, &modification.replacement_text),
                similarity: 1.0,
            });
        }

        let haystack = &text[scope.clone()];
        if let Some(found) = haystack.find(needle) {
            let start = scope.start + found;
            return Ok(PatchOutcome {
                text: splice(text, start..start + needle.len(), &modification.replacement_text),
                similarity: 1.0,
            });
        }

        match best_fuzzy_match(haystack, needle) {
            Some((range, similarity)) if similarity >= self.threshold => {
                let absolute = scope.start + range.start..scope.start + range.end;
                Ok(PatchOutcome {
                    text: splice(text, absolute, &modification.replacement_text),
                    similarity,
                })
            }
            Some((_, similarity)) => Err(PatchFailure {
                index,
                reason: format!(
                    "original text not found; best match similarity {:.2} is below {:.2}",
                    similarity, self.threshold
                ),
                best_similarity: similarity,
            }),
            None => Err(PatchFailure {
                index,
                reason: "original text not found; no candidate region".to_string(),
                best_similarity: 0.0,
            }),
        }
    }

    /// Left-to-right fold over `modifications`; stops at the first failure.
    /// Returns the final text and the similarity of each applied edit.
    pub fn apply_all(
        &self,
        text: &str,
        modifications: &[Modification],
    ) -> Result<(String, Vec<f32>), PatchFailure> {
        modifications.iter().enumerate().try_fold(
            (text.to_string(), Vec::with_capacity(modifications.len())),
            |(acc, mut similarities), (index, modification)| {
                let outcome = self.apply(&acc, modification, index)?;
                similarities.push(outcome.similarity);
                Ok((outcome.text, similarities))
            },
        )
    }
}

fn splice(text: &str, range: Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..range.start]);
    out.push_str(replacement);
    out.push_str(&text[range.end..]);
    out
}

/// Insert at the end of the located section, or append to the whole text
fn insert(text: &str, scope: Range<usize>, section_matched: bool, addition: &str) -> String {
    let addition = addition.trim_end();
    if !section_matched {
        let body = text.trim_end();
        if body.is_empty() {
            return addition.to_string();
        }
        return format!("{}\n\n{}\n", body, addition);
    }

    let section = &text[scope.clone()];
    let at = scope.start + section.trim_end().len();
    let mut out = String::with_capacity(text.len() + addition.len() + 1);
    out.push_str(&text[..at]);
    out.push('\n');
    out.push_str(addition);
    out.push_str(&text[at..]);
    out
}

/// `(level, title)` of a Markdown ATX heading line
fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((level, rest.trim()))
}

fn normalize_title(title: &str) -> String {
    title
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_end_matches(':')
        .to_lowercase()
}

/// Byte range of the section whose heading matches `locator`: from the
/// heading line up to the next heading of the same or a higher level.
fn section_range(text: &str, locator: &str) -> Option<Range<usize>> {
    let wanted = normalize_title(locator);
    if wanted.is_empty() {
        return None;
    }

    let mut offset = 0;
    let mut open: Option<(usize, usize)> = None;
    for line in text.split_inclusive('\n') {
        if let Some((level, title)) = heading(line) {
            match open {
                Some((start, open_level)) if level <= open_level => return Some(start..offset),
                None if normalize_title(title) == wanted => open = Some((offset, level)),
                _ => {}
            }
        }
        offset += line.len();
    }

    open.map(|(start, _)| start..text.len())
}

/// Byte ranges of whitespace-separated words
fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(s..i);
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(s..text.len());
    }
    spans
}

/// Best-scoring window of `haystack` for `needle`, as (byte range, ratio)
fn best_fuzzy_match(haystack: &str, needle: &str) -> Option<(Range<usize>, f32)> {
    let words = word_spans(haystack);
    let needle_words: Vec<String> = needle.split_whitespace().map(str::to_lowercase).collect();
    let n = needle_words.len();
    if words.is_empty() || n == 0 {
        return None;
    }

    let vocabulary: HashSet<&str> = needle_words.iter().map(String::as_str).collect();
    let lowered: Vec<String> = words.iter().map(|r| haystack[r.clone()].to_lowercase()).collect();
    let drift = (n / 10).clamp(1, 8);

    let mut candidates: Vec<(usize, Range<usize>)> = Vec::new();
    for len in n.saturating_sub(drift).max(1)..=(n + drift).min(words.len()) {
        for start in 0..=(words.len() - len) {
            let overlap = lowered[start..start + len]
                .iter()
                .filter(|w| vocabulary.contains(w.as_str()))
                .count();
            if overlap == 0 {
                continue;
            }
            candidates.push((overlap, words[start].start..words[start + len - 1].end));
        }
    }

    // Highest overlap first; ties keep document order
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.start.cmp(&b.1.start)));
    candidates.dedup_by(|a, b| a.1 == b.1);

    candidates
        .into_iter()
        .take(SCORED_CANDIDATES)
        .map(|(_, range)| {
            let ratio = TextDiff::from_chars(&haystack[range.clone()], needle).ratio();
            (range, ratio)
        })
        .fold(None, |best: Option<(Range<usize>, f32)>, (range, ratio)| match best {
            Some((_, best_ratio)) if best_ratio >= ratio => best,
            _ => Some((range, ratio)),
        })
}
