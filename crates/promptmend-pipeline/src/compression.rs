//! Deterministic, local heuristics that shrink an over-budget prompt.

use promptmend_core::CompressionConfig;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on heuristic passes; each pass only removes text, so the
/// loop reaches a fixpoint well before this in practice.
const MAX_PASSES: usize = 8;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One text-shrinking rule
pub trait Heuristic: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, text: &str) -> Result<String, CompressionError>;
}

fn compile(pattern: &str) -> Result<Regex, CompressionError> {
    Regex::new(pattern).map_err(|source| CompressionError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn is_heading(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Long runs of list items keep their first few entries plus a marker
pub struct ListCollapse {
    pattern: String,
    keep: usize,
}

impl ListCollapse {
    pub fn new(pattern: impl Into<String>, keep: usize) -> Self {
        Self {
            pattern: pattern.into(),
            keep: keep.max(1),
        }
    }
}

impl Heuristic for ListCollapse {
    fn name(&self) -> &str {
        "list-collapse"
    }

    fn apply(&self, text: &str) -> Result<String, CompressionError> {
        let item = compile(&self.pattern)?;
        let lines: Vec<&str> = text.split('\n').collect();
        let mut out: Vec<String> = Vec::with_capacity(lines.len());

        let mut i = 0;
        while i < lines.len() {
            if !item.is_match(lines[i]) {
                out.push(lines[i].to_string());
                i += 1;
                continue;
            }

            let run_end = lines[i..]
                .iter()
                .position(|line| !item.is_match(line))
                .map_or(lines.len(), |offset| i + offset);
            let run = &lines[i..run_end];

            if run.len() > self.keep {
                out.extend(run[..self.keep].iter().map(|line| line.to_string()));
                let indent: String = run[0].chars().take_while(|c| c.is_whitespace()).collect();
                out.push(format!(
                    "{}[... {} more items omitted]",
                    indent,
                    run.len() - self.keep
                ));
            } else {
                out.extend(run.iter().map(|line| line.to_string()));
            }
            i = run_end;
        }

        Ok(out.join("\n"))
    }
}

/// "Example:" blocks are cut to a character cap with a trailing ellipsis.
///
/// A block is the text after the label on its line plus the following lines,
/// up to a blank line, a heading or the next label.
pub struct ExampleTruncation {
    label_pattern: String,
    cap: usize,
}

impl ExampleTruncation {
    pub fn new(label_pattern: impl Into<String>, cap: usize) -> Self {
        Self {
            label_pattern: label_pattern.into(),
            cap: cap.max(4),
        }
    }
}

impl Heuristic for ExampleTruncation {
    fn name(&self) -> &str {
        "example-truncation"
    }

    fn apply(&self, text: &str) -> Result<String, CompressionError> {
        let label = compile(&self.label_pattern)?;
        let lines: Vec<&str> = text.split('\n').collect();
        let mut out: Vec<String> = Vec::with_capacity(lines.len());

        let mut i = 0;
        while i < lines.len() {
            let Some(found) = label.find(lines[i]) else {
                out.push(lines[i].to_string());
                i += 1;
                continue;
            };

            let mut end = i + 1;
            while end < lines.len()
                && !lines[end].trim().is_empty()
                && !is_heading(lines[end])
                && !label.is_match(lines[end])
            {
                end += 1;
            }

            let head = &lines[i][..found.end()];
            let mut content = lines[i][found.end()..].to_string();
            for line in &lines[i + 1..end] {
                content.push('\n');
                content.push_str(line);
            }

            if content.chars().count() > self.cap {
                let cut = content
                    .char_indices()
                    .nth(self.cap - 3)
                    .map_or(content.len(), |(at, _)| at);
                content.truncate(cut);
                content.push_str("...");
            }

            out.push(format!("{}{}", head, content));
            i = end;
        }

        Ok(out.join("\n"))
    }
}

/// Whitespace-only lines become empty and runs of empty lines shrink to one
pub struct BlankLineCollapse;

impl Heuristic for BlankLineCollapse {
    fn name(&self) -> &str {
        "blank-line-collapse"
    }

    fn apply(&self, text: &str) -> Result<String, CompressionError> {
        let mut out: Vec<&str> = Vec::new();
        let mut previous_blank = false;
        for line in text.split('\n') {
            let blank = line.trim().is_empty();
            if blank && previous_blank {
                continue;
            }
            out.push(if blank { "" } else { line });
            previous_blank = blank;
        }
        Ok(out.join("\n"))
    }
}

pub struct CompressionAgent {
    heuristics: Vec<Box<dyn Heuristic>>,
}

impl CompressionAgent {
    pub fn new(config: &CompressionConfig) -> Self {
        Self::with_heuristics(vec![
            Box::new(ListCollapse::new(
                config.list_item_pattern.clone(),
                config.max_list_items,
            )),
            Box::new(ExampleTruncation::new(
                config.example_label_pattern.clone(),
                config.example_char_cap,
            )),
            Box::new(BlankLineCollapse),
        ])
    }

    pub fn with_heuristics(heuristics: Vec<Box<dyn Heuristic>>) -> Self {
        Self { heuristics }
    }

    /// Run every heuristic in order until the text stops changing. A
    /// heuristic that fails is logged and skipped for that pass.
    pub fn compress(&self, text: &str) -> String {
        let mut current = text.to_string();
        for pass in 1..=MAX_PASSES {
            let next = self.single_pass(&current);
            if next == current {
                debug!(pass, "compression reached a fixpoint");
                break;
            }
            current = next;
        }
        current
    }

    fn single_pass(&self, text: &str) -> String {
        self.heuristics
            .iter()
            .fold(text.to_string(), |acc, heuristic| match heuristic.apply(&acc) {
                Ok(next) => next,
                Err(e) => {
                    warn!(heuristic = heuristic.name(), "compression heuristic failed: {}", e);
                    acc
                }
            })
    }
}

impl Default for CompressionAgent {
    fn default() -> Self {
        Self::new(&CompressionConfig::default())
    }
}
