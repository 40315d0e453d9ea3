use serde::{Deserialize, Serialize};

use crate::VcsError;

/// Author or committer identity with its timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub date: i64,
    /// Timezone offset in minutes east of UTC.
    pub tz_offset: i32,
}

/// One commit of the revision graph. `id` in canonical form is the cache key
/// for everything derived from the commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Commit {
    pub id: String,
    pub author: Signature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<Signature>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// A page of the commit log plus the total count behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitList {
    pub commits: Vec<Commit>,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Branch {
    pub name: String,
    pub commit_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub name: String,
    pub commit_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryKind {
    File,
    Dir,
    Symlink,
}

/// A file, directory or symlink at (commit, path).
///
/// Directories carry their children in `entries`, sorted directories first
/// and alphabetically within each kind. Files carry `contents`; symlinks
/// carry their target in `contents`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TreeEntry {
    pub name: String,
    #[serde(rename = "Type")]
    pub kind: TreeEntryKind,
    pub size: i64,
    /// Seconds since the Unix epoch; the commit's own timestamp, since trees
    /// store no modification times of their own.
    pub mod_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<TreeEntry>,
}

/// Order `entries` the way directory listings are served: directories before
/// files, alphabetical within each kind.
pub(crate) fn sort_tree_entries(entries: &mut [TreeEntry]) {
    entries.sort_by(|a, b| {
        let a_dir = a.kind == TreeEntryKind::Dir;
        let b_dir = b.kind == TreeEntryKind::Dir;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
}

/// A selection within a file, expressed in both line and byte coordinates.
/// Lines are 1-based and inclusive; bytes are 0-based and end-exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileRange {
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
}

/// How to trim a file before returning it.
///
/// A zero `range` with no flags means the entire file. Line and byte
/// selections are exclusive of each other; line coordinates win when both
/// are set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetFileOptions {
    pub range: FileRange,
    /// Grow a line selection by this many lines in both directions.
    pub expand_context_lines: i64,
    /// Snap a byte selection outward to whole lines.
    pub full_lines: bool,
    /// Ignore the range and return everything.
    pub entire_file: bool,
}

/// A file entry trimmed to a resolved range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWithRange {
    #[serde(flatten)]
    pub entry: TreeEntry,
    #[serde(rename = "FileRange")]
    pub range: FileRange,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlameOptions {
    /// Blame at this commit; empty means the repository tip.
    pub newest_commit: String,
    /// Ignore history older than this commit when set.
    pub oldest_commit: String,
    /// 1-based line window; zero means unbounded on that side.
    pub start_line: i64,
    pub end_line: i64,
}

/// One blame hunk: a contiguous run of lines introduced by one commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hunk {
    pub start_line: i64,
    pub end_line: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub commit_id: String,
    pub author: Signature,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitsOptions {
    /// Commit id to log from; empty means the repository tip.
    pub head: String,
    /// Page size; zero means no limit.
    pub n: u64,
    /// Commits to skip before the page starts.
    pub skip: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Fixed string to look for.
    pub query: String,
    /// Maximum results; zero means no limit.
    pub n: i64,
    /// Results to skip before collecting.
    pub offset: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchResult {
    pub file: String,
    pub start_line: i64,
    pub end_line: i64,
    #[serde(rename = "Match")]
    pub matched: String,
}

/// An opaque raw diff payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Diff {
    pub raw: String,
}

/// Resolve `opt` against file contents into a concrete [`FileRange`]
/// covering the same selection in line and byte coordinates.
pub fn compute_file_range(data: &[u8], opt: &GetFileOptions) -> Result<FileRange, VcsError> {
    let lines = line_spans(data);
    let line_count = lines.len() as i64;

    let whole = FileRange {
        start_line: if line_count == 0 { 0 } else { 1 },
        end_line: line_count,
        start_byte: 0,
        end_byte: data.len() as i64,
    };

    let has_line_range = opt.range.start_line != 0 || opt.range.end_line != 0;
    let has_byte_range = opt.range.start_byte != 0 || opt.range.end_byte != 0;
    if opt.entire_file || (!has_line_range && !has_byte_range) {
        return Ok(whole);
    }
    if line_count == 0 {
        return Ok(whole);
    }

    let (mut start_line, mut end_line) = if has_line_range {
        let start = if opt.range.start_line == 0 {
            1
        } else {
            opt.range.start_line
        };
        let end = if opt.range.end_line == 0 {
            line_count
        } else {
            opt.range.end_line
        };
        if start < 0 || end < 0 || start > end {
            return Err(VcsError::InvalidFileRange(format!(
                "lines {start}..{end}"
            )));
        }
        (start, end)
    } else {
        let len = data.len() as i64;
        let start = opt.range.start_byte.clamp(0, len);
        let end = if opt.range.end_byte == 0 {
            len
        } else {
            opt.range.end_byte.clamp(0, len)
        };
        if start > end {
            return Err(VcsError::InvalidFileRange(format!("bytes {start}..{end}")));
        }
        let start_line = line_of_byte(&lines, start) + 1;
        let end_line = if end == start {
            start_line
        } else {
            line_of_byte(&lines, end - 1) + 1
        };
        if !opt.full_lines && opt.expand_context_lines == 0 {
            return Ok(FileRange {
                start_line,
                end_line,
                start_byte: start,
                end_byte: end,
            });
        }
        (start_line, end_line)
    };

    start_line = (start_line - opt.expand_context_lines).max(1).min(line_count);
    end_line = (end_line + opt.expand_context_lines).max(start_line).min(line_count);

    let start_byte = lines[(start_line - 1) as usize].0 as i64;
    let end_byte = lines[(end_line - 1) as usize].1 as i64;
    Ok(FileRange {
        start_line,
        end_line,
        start_byte,
        end_byte,
    })
}

/// Byte spans of each line, newline included. A trailing newline does not
/// open a final empty line.
pub(crate) fn line_spans(data: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (pos, byte) in data.iter().enumerate() {
        if *byte == b'\n' {
            spans.push((start, pos + 1));
            start = pos + 1;
        }
    }
    if start < data.len() {
        spans.push((start, data.len()));
    }
    spans
}

/// 0-based index of the line containing byte `pos`.
fn line_of_byte(lines: &[(usize, usize)], pos: i64) -> i64 {
    let pos = pos as usize;
    for (idx, (start, end)) in lines.iter().enumerate() {
        if pos >= *start && pos < *end {
            return idx as i64;
        }
    }
    lines.len().saturating_sub(1) as i64
}
