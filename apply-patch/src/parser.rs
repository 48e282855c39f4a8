//! Parses and validates a patch into a list of hunks without touching the
//! filesystem.
//!
//! The accepted dialect:
//!
//! start: begin_patch hunk+ end_patch
//! begin_patch: "*** Begin Patch" LF
//! end_patch: "*** End Patch" LF?
//!
//! hunk: add_hunk | delete_hunk | update_hunk
//! add_hunk: "*** Add File: " filename LF add_line+
//! delete_hunk: "*** Delete File: " filename LF
//! update_hunk: "*** Update File: " filename LF change_move? change?
//! add_line: "+" /(.*)/ LF
//!
//! change_move: "*** Move to: " filename LF
//! change: (change_context | change_line)+ eof_line?
//! change_context: ("@@" | "@@ " /(.+)/) LF
//! change_line: ("+" | "-" | " ") /(.*)/ LF
//! eof_line: "*** End of File" LF
//!
//! A wrapping `<<EOF` / `EOF` heredoc pair around the envelope is tolerated
//! and stripped before parsing. Error positions are 1-based line numbers
//! within the (unwrapped) patch text.

use std::path::PathBuf;

use thiserror::Error;

const BEGIN_PATCH_MARKER: &str = "*** Begin Patch";
const END_PATCH_MARKER: &str = "*** End Patch";
const ADD_FILE_MARKER: &str = "*** Add File: ";
const DELETE_FILE_MARKER: &str = "*** Delete File: ";
const UPDATE_FILE_MARKER: &str = "*** Update File: ";
const MOVE_TO_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const CHANGE_CONTEXT_MARKER: &str = "@@ ";
const EMPTY_CHANGE_CONTEXT_MARKER: &str = "@@";

#[derive(Debug, PartialEq, Error)]
pub enum ParseError {
    #[error("invalid patch: {0}")]
    InvalidPatchError(String),
    #[error("invalid hunk at line {line_number}, {message}")]
    InvalidHunkError { message: String, line_number: usize },
}
use ParseError::*;

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Hunk {
    AddFile {
        path: PathBuf,
        contents: String,
    },
    DeleteFile {
        path: PathBuf,
    },
    UpdateFile {
        path: PathBuf,
        move_path: Option<PathBuf>,

        /// Chunks are ordered: each one anchors at or after the position
        /// where the previous chunk matched.
        chunks: Vec<UpdateFileChunk>,
    },
}
use Hunk::*;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateFileChunk {
    /// A single line used to narrow down where the chunk applies (usually a
    /// class, method, or function definition).
    pub change_context: Option<String>,

    /// The contiguous block of lines to be replaced by `new_lines`.
    /// `old_lines` must occur strictly after `change_context`.
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,

    /// When true, `old_lines` must sit at the end of the file. Trailing
    /// newline differences are tolerated.
    pub is_end_of_file: bool,
}

pub fn parse_patch(patch: &str) -> Result<Vec<Hunk>, ParseError> {
    let mut lines: Vec<&str> = patch.trim().lines().collect();
    strip_heredoc_wrapper(&mut lines);
    if lines.first().map(|l| l.trim()) != Some(BEGIN_PATCH_MARKER) {
        return Err(InvalidPatchError(String::from(
            "The first line of the patch must be '*** Begin Patch'",
        )));
    }
    let last_line_index = lines.len() - 1;
    if lines[last_line_index].trim() != END_PATCH_MARKER {
        return Err(InvalidPatchError(String::from(
            "The last line of the patch must be '*** End Patch'",
        )));
    }
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut remaining_lines = &lines[1..last_line_index];
    // Line numbers reported to the user are 1-based; the body starts on line 2.
    let mut line_number = 2;
    while !remaining_lines.is_empty() {
        let (hunk, consumed) = parse_one_hunk(remaining_lines, line_number)?;
        hunks.push(hunk);
        line_number += consumed;
        remaining_lines = &remaining_lines[consumed..];
    }
    Ok(hunks)
}

/// Remove a `<<EOF` / `EOF` heredoc wrapper around the envelope, if present.
/// The delimiter may be quoted (`<<'EOF'`, `<<"EOF"`).
fn strip_heredoc_wrapper(lines: &mut Vec<&str>) {
    if lines.len() < 2 {
        return;
    }
    let Some(first) = lines.first().map(|l| l.trim()) else {
        return;
    };
    let Some(delimiter) = first.strip_prefix("<<") else {
        return;
    };
    let delimiter = delimiter
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    if delimiter.is_empty() {
        return;
    }
    if lines.last().map(|l| l.trim()) == Some(delimiter.as_str()) {
        lines.pop();
        lines.remove(0);
    }
}

/// Render hunks back into patch text. `parse_patch(serialize_hunks(h))`
/// round-trips the hunk structure (modulo line-ending normalisation).
pub fn serialize_hunks(hunks: &[Hunk]) -> String {
    let mut out = String::new();
    out.push_str(BEGIN_PATCH_MARKER);
    out.push('\n');
    for hunk in hunks {
        match hunk {
            AddFile { path, contents } => {
                out.push_str(&format!("{ADD_FILE_MARKER}{}\n", path.display()));
                for line in contents.lines() {
                    out.push('+');
                    out.push_str(line);
                    out.push('\n');
                }
            }
            DeleteFile { path } => {
                out.push_str(&format!("{DELETE_FILE_MARKER}{}\n", path.display()));
            }
            UpdateFile {
                path,
                move_path,
                chunks,
            } => {
                out.push_str(&format!("{UPDATE_FILE_MARKER}{}\n", path.display()));
                if let Some(dest) = move_path {
                    out.push_str(&format!("{MOVE_TO_MARKER}{}\n", dest.display()));
                }
                for chunk in chunks {
                    match &chunk.change_context {
                        Some(ctx) => out.push_str(&format!("{CHANGE_CONTEXT_MARKER}{ctx}\n")),
                        None => out.push_str(&format!("{EMPTY_CHANGE_CONTEXT_MARKER}\n")),
                    }
                    // Interleave shared context lines, then removals, then
                    // additions. Shared prefixes/suffixes are emitted as
                    // context so that the output stays minimal.
                    let shared_prefix = chunk
                        .old_lines
                        .iter()
                        .zip(chunk.new_lines.iter())
                        .take_while(|(old, new)| old == new)
                        .count();
                    let shared_suffix = chunk.old_lines[shared_prefix..]
                        .iter()
                        .rev()
                        .zip(chunk.new_lines[shared_prefix..].iter().rev())
                        .take_while(|(old, new)| old == new)
                        .count();
                    for line in &chunk.old_lines[..shared_prefix] {
                        out.push_str(&format!(" {line}\n"));
                    }
                    for line in &chunk.old_lines[shared_prefix..chunk.old_lines.len() - shared_suffix]
                    {
                        out.push_str(&format!("-{line}\n"));
                    }
                    for line in &chunk.new_lines[shared_prefix..chunk.new_lines.len() - shared_suffix]
                    {
                        out.push_str(&format!("+{line}\n"));
                    }
                    for line in &chunk.old_lines[chunk.old_lines.len() - shared_suffix..] {
                        out.push_str(&format!(" {line}\n"));
                    }
                    if chunk.is_end_of_file {
                        out.push_str(EOF_MARKER);
                        out.push('\n');
                    }
                }
            }
        }
    }
    out.push_str(END_PATCH_MARKER);
    out
}

/// Parse a single hunk from the start of `lines`. Returns the hunk and the
/// number of lines consumed.
fn parse_one_hunk(lines: &[&str], line_number: usize) -> Result<(Hunk, usize), ParseError> {
    // Tolerate extra padding around marker strings.
    let first_line = lines[0].trim();
    if let Some(path) = first_line.strip_prefix(ADD_FILE_MARKER) {
        let mut contents = String::new();
        let mut consumed = 1;
        for add_line in &lines[1..] {
            if let Some(line_to_add) = add_line.strip_prefix('+') {
                contents.push_str(line_to_add);
                contents.push('\n');
                consumed += 1;
            } else {
                break;
            }
        }
        return Ok((
            AddFile {
                path: PathBuf::from(path),
                contents,
            },
            consumed,
        ));
    }
    if let Some(path) = first_line.strip_prefix(DELETE_FILE_MARKER) {
        return Ok((
            DeleteFile {
                path: PathBuf::from(path),
            },
            1,
        ));
    }
    if let Some(path) = first_line.strip_prefix(UPDATE_FILE_MARKER) {
        let mut remaining_lines = &lines[1..];
        let mut consumed = 1;

        let move_path = remaining_lines
            .first()
            .and_then(|x| x.strip_prefix(MOVE_TO_MARKER));
        if move_path.is_some() {
            remaining_lines = &remaining_lines[1..];
            consumed += 1;
        }

        let mut chunks = Vec::new();
        while !remaining_lines.is_empty() {
            // Blank separator lines between chunks are skipped.
            if remaining_lines[0].trim().is_empty() {
                consumed += 1;
                remaining_lines = &remaining_lines[1..];
                continue;
            }
            // The next `***` header ends this hunk.
            if remaining_lines[0].starts_with("***") {
                break;
            }

            let (chunk, chunk_lines) = parse_update_file_chunk(
                remaining_lines,
                line_number + consumed,
                chunks.is_empty(),
            )?;
            chunks.push(chunk);
            consumed += chunk_lines;
            remaining_lines = &remaining_lines[chunk_lines..];
        }

        if chunks.is_empty() {
            return Err(InvalidHunkError {
                message: format!("Update file hunk for path '{path}' is empty"),
                line_number,
            });
        }

        return Ok((
            UpdateFile {
                path: PathBuf::from(path),
                move_path: move_path.map(PathBuf::from),
                chunks,
            },
            consumed,
        ));
    }

    Err(InvalidHunkError {
        message: format!(
            "'{first_line}' is not a valid hunk header. Valid hunk headers: '*** Add File: {{path}}', '*** Delete File: {{path}}', '*** Update File: {{path}}'"
        ),
        line_number,
    })
}

fn parse_update_file_chunk(
    lines: &[&str],
    line_number: usize,
    allow_missing_context: bool,
) -> Result<(UpdateFileChunk, usize), ParseError> {
    if lines.is_empty() {
        return Err(InvalidHunkError {
            message: "Update hunk does not contain any lines".to_string(),
            line_number,
        });
    }
    // A chunk opens with `@@` (no context) or `@@ <context>`. The first chunk
    // of an update hunk may start directly with change lines.
    let (change_context, start_index) = if lines[0] == EMPTY_CHANGE_CONTEXT_MARKER {
        (None, 1)
    } else if let Some(context) = lines[0].strip_prefix(CHANGE_CONTEXT_MARKER) {
        (Some(context.to_string()), 1)
    } else {
        if !allow_missing_context {
            return Err(InvalidHunkError {
                message: format!(
                    "Expected update hunk to start with a @@ context marker, got: '{}'",
                    lines[0]
                ),
                line_number,
            });
        }
        (None, 0)
    };
    if start_index >= lines.len() {
        return Err(InvalidHunkError {
            message: "Update hunk does not contain any lines".to_string(),
            line_number: line_number + 1,
        });
    }
    let mut chunk = UpdateFileChunk {
        change_context,
        ..Default::default()
    };
    let mut parsed_lines = 0;
    for line in &lines[start_index..] {
        match *line {
            EOF_MARKER => {
                if parsed_lines == 0 {
                    return Err(InvalidHunkError {
                        message: "Update hunk does not contain any lines".to_string(),
                        line_number: line_number + 1,
                    });
                }
                chunk.is_end_of_file = true;
                parsed_lines += 1;
                break;
            }
            line_contents => {
                match line_contents.chars().next() {
                    None => {
                        // A fully empty patch line stands for an empty line of
                        // context.
                        chunk.old_lines.push(String::new());
                        chunk.new_lines.push(String::new());
                    }
                    Some(' ') => {
                        chunk.old_lines.push(line_contents[1..].to_string());
                        chunk.new_lines.push(line_contents[1..].to_string());
                    }
                    Some('+') => {
                        chunk.new_lines.push(line_contents[1..].to_string());
                    }
                    Some('-') => {
                        chunk.old_lines.push(line_contents[1..].to_string());
                    }
                    _ => {
                        if parsed_lines == 0 {
                            return Err(InvalidHunkError {
                                message: format!(
                                    "Unexpected line found in update hunk: '{line_contents}'. Every line should start with ' ' (context line), '+' (added line), or '-' (removed line)"
                                ),
                                line_number: line_number + 1,
                            });
                        }
                        // Assume this is the start of the next chunk.
                        break;
                    }
                }
                parsed_lines += 1;
            }
        }
    }

    Ok((chunk, parsed_lines + start_index))
}
