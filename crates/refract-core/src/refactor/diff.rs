//! Text edits and their preview as hunks and unified diffs.
//!
//! Edits are applied in reverse offset order so earlier spans stay valid
//! while later ones are spliced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{RefractError, RefractResult};
use crate::models::{LineIndex, Span};
use crate::refactor::fs::SourceReader;

/// Unchanged lines shown around each change.
pub const CONTEXT_LINES: usize = 2;

/// Above this many LCS cells a changed block is shown as a plain
/// remove-then-add.
const LCS_CELL_LIMIT: usize = 4_000_000;

/// Replace `original` at `span` of `path` with `replacement`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub path: String,
    pub span: Span,
    pub original: String,
    pub replacement: String,
}

// ---------------------------------------------------------------------------
// Applying edits
// ---------------------------------------------------------------------------

/// Apply `edits` to `content`, checking bounds, overlap and that each span
/// still holds the text the edit was planned against.
pub fn apply_edits(content: &str, edits: &[&Edit]) -> RefractResult<String> {
    let mut ordered: Vec<&Edit> = edits.to_vec();
    ordered.sort_by(|a, b| {
        b.span
            .start
            .cmp(&a.span.start)
            .then(b.span.end.cmp(&a.span.end))
    });

    let mut floor = usize::MAX;
    for edit in &ordered {
        let Span { start, end, .. } = edit.span;
        if start > end
            || end > content.len()
            || !content.is_char_boundary(start)
            || !content.is_char_boundary(end)
        {
            return Err(RefractError::InvalidIntent(format!(
                "edit {start}..{end} is outside {}",
                edit.path
            )));
        }
        if end > floor {
            return Err(RefractError::InvalidIntent(format!(
                "edits overlap in {} at line {}",
                edit.path, edit.span.start_line
            )));
        }
        if content[start..end] != *edit.original {
            return Err(RefractError::InvalidIntent(format!(
                "{} no longer holds the planned text at line {}",
                edit.path, edit.span.start_line
            )));
        }
        floor = start;
    }
    Ok(splice(content, 0, &ordered))
}

/// Splice already-validated edits into `text`, which starts at byte `base`
/// of the file the edits refer to.
fn splice(text: &str, base: usize, edits: &[&Edit]) -> String {
    let mut ordered: Vec<&Edit> = edits.to_vec();
    ordered.sort_by(|a, b| {
        b.span
            .start
            .cmp(&a.span.start)
            .then(b.span.end.cmp(&a.span.end))
    });
    let mut out = text.to_string();
    for edit in ordered {
        out.replace_range(
            edit.span.start - base..edit.span.end - base,
            &edit.replacement,
        );
    }
    out
}

// ---------------------------------------------------------------------------
// Diff model
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTag {
    Context,
    Removed,
    Added,
}

impl LineTag {
    fn prefix(self) -> char {
        match self {
            LineTag::Context => ' ',
            LineTag::Removed => '-',
            LineTag::Added => '+',
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub tag: LineTag,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<DiffLine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub before: String,
    pub after: String,
    pub hunks: Vec<Hunk>,
}

impl FileDiff {
    pub fn unified(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("--- a/{}\n", self.path));
        out.push_str(&format!("+++ b/{}\n", self.path));
        for hunk in &self.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
            ));
            for line in &hunk.lines {
                out.push(line.tag.prefix());
                out.push_str(&line.text);
                out.push('\n');
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub plan_id: String,
    pub files: Vec<FileDiff>,
    pub unified: String,
}

/// Before/after text and hunks for every file touched by `edits`.
pub fn preview(
    plan_id: &str,
    edits: &[Edit],
    reader: &dyn SourceReader,
) -> RefractResult<Diff> {
    let mut by_path: BTreeMap<&str, Vec<&Edit>> = BTreeMap::new();
    for edit in edits {
        by_path.entry(edit.path.as_str()).or_default().push(edit);
    }
    let mut files = Vec::with_capacity(by_path.len());
    for (path, file_edits) in by_path {
        let before = reader.read(path)?;
        files.push(file_diff(path, before, &file_edits)?);
    }
    let unified = files.iter().map(FileDiff::unified).collect();
    Ok(Diff {
        plan_id: plan_id.to_string(),
        files,
        unified,
    })
}

pub fn file_diff(path: &str, before: String, edits: &[&Edit]) -> RefractResult<FileDiff> {
    let after = apply_edits(&before, edits)?;
    let hunks = hunks(&before, edits);
    Ok(FileDiff {
        path: path.to_string(),
        before,
        after,
        hunks,
    })
}

// ---------------------------------------------------------------------------
// Hunks
// ---------------------------------------------------------------------------

fn hunks(before: &str, edits: &[&Edit]) -> Vec<Hunk> {
    let index = LineIndex::new(before);
    let total = index.line_count();

    let mut ranges: Vec<(usize, usize)> = edits
        .iter()
        .map(|e| {
            let first = index.line_of(e.span.start);
            let last = if e.span.end > e.span.start {
                index.line_of(e.span.end - 1)
            } else {
                first
            };
            (
                first.saturating_sub(CONTEXT_LINES).max(1),
                (last + CONTEXT_LINES).min(total),
            )
        })
        .collect();
    ranges.sort();
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (a, b) in ranges {
        match merged.last_mut() {
            Some(last) if a <= last.1 + 1 => last.1 = last.1.max(b),
            _ => merged.push((a, b)),
        }
    }

    let mut out = Vec::with_capacity(merged.len());
    let mut delta: isize = 0;
    for (a, b) in merged {
        let start = index.line_start(a);
        let end = index.line_start(b + 1);
        let inside: Vec<&Edit> = edits
            .iter()
            .copied()
            .filter(|e| start <= e.span.start && e.span.end <= end)
            .collect();
        let old_text = &before[start..end];
        let new_text = splice(old_text, start, &inside);
        let old_lines: Vec<&str> = old_text.split_inclusive('\n').collect();
        let new_lines: Vec<&str> = new_text.split_inclusive('\n').collect();
        let lines = diff_lines(&old_lines, &new_lines);
        if lines.iter().all(|l| l.tag == LineTag::Context) {
            continue;
        }

        let old_start = if old_lines.is_empty() { a - 1 } else { a };
        let new_first = (a as isize + delta).max(1) as usize;
        let new_start = if new_lines.is_empty() {
            new_first - 1
        } else {
            new_first
        };
        delta += new_lines.len() as isize - old_lines.len() as isize;
        out.push(Hunk {
            old_start,
            old_lines: old_lines.len(),
            new_start,
            new_lines: new_lines.len(),
            lines,
        });
    }
    out
}

fn display(line: &str) -> String {
    line.trim_end_matches('\n').trim_end_matches('\r').to_string()
}

/// Line diff of one region: common prefix and suffix as context, an LCS
/// walk over the middle.
fn diff_lines(old: &[&str], new: &[&str]) -> Vec<DiffLine> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let context = |line: &str| DiffLine {
        tag: LineTag::Context,
        text: display(line),
    };
    let mut out: Vec<DiffLine> = old[..prefix].iter().map(|l| context(l)).collect();

    if old_mid.len().saturating_mul(new_mid.len()) > LCS_CELL_LIMIT {
        out.extend(old_mid.iter().map(|l| DiffLine {
            tag: LineTag::Removed,
            text: display(l),
        }));
        out.extend(new_mid.iter().map(|l| DiffLine {
            tag: LineTag::Added,
            text: display(l),
        }));
    } else {
        out.extend(lcs_walk(old_mid, new_mid));
    }

    out.extend(old[old.len() - suffix..].iter().map(|l| context(l)));
    out
}

fn lcs_walk(old: &[&str], new: &[&str]) -> Vec<DiffLine> {
    let (n, m) = (old.len(), new.len());
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if old[i] == new[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut out = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            out.push(DiffLine {
                tag: LineTag::Context,
                text: display(old[i]),
            });
            i += 1;
            j += 1;
        } else if j == m || (i < n && table[(i + 1) * width + j] >= table[i * width + j + 1]) {
            out.push(DiffLine {
                tag: LineTag::Removed,
                text: display(old[i]),
            });
            i += 1;
        } else {
            out.push(DiffLine {
                tag: LineTag::Added,
                text: display(new[j]),
            });
            j += 1;
        }
    }
    out
}
