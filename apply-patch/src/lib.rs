mod parser;
mod seek;

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Error;
pub use parser::Hunk;
pub use parser::ParseError;
use parser::ParseError::*;
pub use parser::UpdateFileChunk;
pub use parser::parse_patch;
pub use parser::serialize_hunks;
use similar::TextDiff;
use thiserror::Error;
use tree_sitter::Parser;
use tree_sitter_bash::LANGUAGE as BASH;

#[derive(Debug, Error)]
pub enum ApplyPatchError {
    #[error(transparent)]
    ParseError(#[from] ParseError),
    #[error(transparent)]
    IoError(#[from] IoError),
    /// A chunk's anchor could not be located in the target file.
    #[error(transparent)]
    MatchError(#[from] MatchError),
}

impl From<std::io::Error> for ApplyPatchError {
    fn from(err: std::io::Error) -> Self {
        ApplyPatchError::IoError(IoError {
            context: "I/O error".to_string(),
            source: err,
        })
    }
}

#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct IoError {
    context: String,
    #[source]
    source: std::io::Error,
}

/// The failure messages are stable: downstream consumers parse them to decide
/// whether to re-read the file and retry the patch.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Failed to find context '{context}' in {}", path.display())]
    Context { path: PathBuf, context: String },
    #[error("Failed to find expected lines in {}", path.display())]
    Lines {
        path: PathBuf,
        /// The old lines the chunk expected to replace, for diagnostics.
        old_lines: Vec<String>,
    },
}

#[derive(Debug)]
pub enum MaybeApplyPatch {
    Body(Vec<Hunk>),
    ShellParseError(Error),
    PatchParseError(ParseError),
    NotApplyPatch,
}

/// Inspect an argv vector and decide whether it is an `apply_patch`
/// invocation, either direct (`apply_patch <body>`) or wrapped in a
/// `bash -lc 'apply_patch <<EOF …'` heredoc.
pub fn maybe_parse_apply_patch(argv: &[String]) -> MaybeApplyPatch {
    match argv {
        [cmd, body] if cmd == "apply_patch" => match parse_patch(body) {
            Ok(hunks) => MaybeApplyPatch::Body(hunks),
            Err(e) => MaybeApplyPatch::PatchParseError(e),
        },
        [bash, flag, script]
            if bash == "bash"
                && (flag == "-lc" || flag == "-c")
                && script.trim_start().starts_with("apply_patch") =>
        {
            match extract_heredoc_body_from_apply_patch_command(script) {
                Ok(body) => match parse_patch(&body) {
                    Ok(hunks) => MaybeApplyPatch::Body(hunks),
                    Err(e) => MaybeApplyPatch::PatchParseError(e),
                },
                Err(e) => MaybeApplyPatch::ShellParseError(e),
            }
        }
        _ => MaybeApplyPatch::NotApplyPatch,
    }
}

/// Pull the heredoc body out of a command like
/// `bash -lc 'apply_patch <<EOF\n*** Begin Patch\n…EOF'` by walking the bash
/// syntax tree rather than string-munging the script.
fn extract_heredoc_body_from_apply_patch_command(src: &str) -> anyhow::Result<String> {
    if !src.trim_start().starts_with("apply_patch") {
        anyhow::bail!("expected command to start with 'apply_patch'");
    }

    let lang = BASH.into();
    let mut parser = Parser::new();
    parser
        .set_language(&lang)
        .context("load bash grammar")?;
    let tree = parser
        .parse(src, None)
        .ok_or_else(|| anyhow::anyhow!("failed to parse patch into AST"))?;

    let bytes = src.as_bytes();
    let mut c = tree.root_node().walk();

    loop {
        let node = c.node();
        if node.kind() == "heredoc_body" {
            let text = node
                .utf8_text(bytes)
                .with_context(|| "failed to interpret heredoc body as UTF-8")?;
            return Ok(text.trim_end_matches('\n').to_owned());
        }

        if c.goto_first_child() {
            continue;
        }
        while !c.goto_next_sibling() {
            if !c.goto_parent() {
                anyhow::bail!("expected to find heredoc_body in patch candidate");
            }
        }
    }
}

/// Parse `patch` and apply it to the filesystem, writing the summary to
/// `stdout` and any diagnostics to `stderr`.
pub fn apply_patch(
    patch: &str,
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<AffectedPaths, ApplyPatchError> {
    let hunks = match parse_patch(patch) {
        Ok(hunks) => hunks,
        Err(e) => {
            match &e {
                InvalidPatchError(message) => {
                    writeln!(stderr, "Invalid patch: {message}").map_err(ApplyPatchError::from)?;
                }
                InvalidHunkError {
                    message,
                    line_number,
                } => {
                    writeln!(stderr, "Invalid patch hunk on line {line_number}: {message}")
                        .map_err(ApplyPatchError::from)?;
                }
            }
            return Err(ApplyPatchError::ParseError(e));
        }
    };

    match apply_hunks_to_files(&hunks) {
        Ok(affected) => {
            print_summary(&affected, stdout).map_err(ApplyPatchError::from)?;
            Ok(affected)
        }
        Err(err) => {
            writeln!(stderr, "{err}").map_err(ApplyPatchError::from)?;
            Err(err)
        }
    }
}

/// File paths touched by a successfully applied patch.
#[derive(Debug, Default)]
pub struct AffectedPaths {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Apply each hunk in order. Files are written as their hunk resolves, so a
/// mid-patch failure leaves the files of earlier hunks already written; the
/// failing file itself is never partially written.
pub fn apply_hunks_to_files(hunks: &[Hunk]) -> Result<AffectedPaths, ApplyPatchError> {
    if hunks.is_empty() {
        return Err(ApplyPatchError::IoError(IoError {
            context: "nothing to apply".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "No files were modified."),
        }));
    }

    let mut affected = AffectedPaths::default();
    for hunk in hunks {
        match hunk {
            Hunk::AddFile { path, contents } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|source| IoError {
                        context: format!(
                            "Failed to create parent directories for {}",
                            path.display()
                        ),
                        source,
                    })?;
                }
                std::fs::write(path, contents).map_err(|source| IoError {
                    context: format!("Failed to write file {}", path.display()),
                    source,
                })?;
                affected.added.push(path.clone());
            }
            Hunk::DeleteFile { path } => {
                std::fs::remove_file(path).map_err(|source| IoError {
                    context: format!("Failed to delete file {}", path.display()),
                    source,
                })?;
                affected.deleted.push(path.clone());
            }
            Hunk::UpdateFile {
                path,
                move_path,
                chunks,
            } => {
                let AppliedPatch { new_contents, .. } =
                    derive_new_contents_from_chunks(path, chunks)?;
                if let Some(dest) = move_path {
                    if let Some(parent) = dest.parent()
                        && !parent.as_os_str().is_empty()
                    {
                        std::fs::create_dir_all(parent).map_err(|source| IoError {
                            context: format!(
                                "Failed to create parent directories for {}",
                                dest.display()
                            ),
                            source,
                        })?;
                    }
                    std::fs::write(dest, new_contents).map_err(|source| IoError {
                        context: format!("Failed to write file {}", dest.display()),
                        source,
                    })?;
                    std::fs::remove_file(path).map_err(|source| IoError {
                        context: format!("Failed to remove original {}", path.display()),
                        source,
                    })?;
                    affected.modified.push(dest.clone());
                } else {
                    std::fs::write(path, new_contents).map_err(|source| IoError {
                        context: format!("Failed to write file {}", path.display()),
                        source,
                    })?;
                    affected.modified.push(path.clone());
                }
            }
        }
    }
    Ok(affected)
}

#[derive(Debug)]
struct AppliedPatch {
    original_contents: String,
    new_contents: String,
}

/// A single planned edit: replace `old_len` lines starting at `start_index`
/// with `new_lines`.
#[derive(Debug, PartialEq)]
struct Replacement {
    start_index: usize,
    old_len: usize,
    new_lines: Vec<String>,
}

/// Compute the full post-patch contents of the file at `path`.
fn derive_new_contents_from_chunks(
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<AppliedPatch, ApplyPatchError> {
    let original_contents = std::fs::read_to_string(path).map_err(|source| IoError {
        context: format!("Failed to read file to update {}", path.display()),
        source,
    })?;

    let mut original_lines: Vec<String> = original_contents
        .split('\n')
        .map(|s| s.to_string())
        .collect();

    // Drop the trailing empty element produced by the final newline so that
    // line counts match the behaviour of standard `diff`.
    if original_lines.last().is_some_and(|s| s.is_empty()) {
        original_lines.pop();
    }

    let replacements = compute_replacements(&original_lines, path, chunks)?;
    let mut new_lines = apply_replacements(original_lines, &replacements);
    if !new_lines.last().is_some_and(|s| s.is_empty()) {
        new_lines.push(String::new());
    }
    let new_contents = new_lines.join("\n");
    Ok(AppliedPatch {
        original_contents,
        new_contents,
    })
}

/// Resolve every chunk against the file, producing the list of replacements
/// to perform. The cursor only moves forward: each chunk anchors at or after
/// the end of the previous chunk's match.
fn compute_replacements(
    original_lines: &[String],
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<Vec<Replacement>, MatchError> {
    let mut replacements: Vec<Replacement> = Vec::new();
    let mut line_index: usize = 0;

    for chunk in chunks {
        if let Some(ctx_line) = &chunk.change_context {
            if let Some(idx) =
                seek::seek_sequence(original_lines, &[ctx_line.clone()], line_index, false)
            {
                line_index = idx + 1;
            } else {
                return Err(MatchError::Context {
                    path: path.to_path_buf(),
                    context: ctx_line.clone(),
                });
            }
        }

        if chunk.old_lines.is_empty() {
            // Pure insertion: append at the end of the file, or just before
            // the final empty line when one exists.
            let insertion_idx = if original_lines.last().is_some_and(|s| s.is_empty()) {
                original_lines.len() - 1
            } else {
                original_lines.len()
            };
            replacements.push(Replacement {
                start_index: insertion_idx,
                old_len: 0,
                new_lines: chunk.new_lines.clone(),
            });
            continue;
        }

        // In many real diffs the last element of `old_lines` is an empty
        // string standing for the terminating newline of the replaced region.
        // That sentinel is absent from `original_lines` (the trailing empty
        // slice was stripped above), so when a direct search fails retry with
        // the trailing empty removed from both pattern and replacement.
        let mut pattern: &[String] = &chunk.old_lines;
        let mut new_slice: &[String] = &chunk.new_lines;
        let mut found =
            seek::seek_sequence(original_lines, pattern, line_index, chunk.is_end_of_file);

        if found.is_none() && pattern.last().is_some_and(|s| s.is_empty()) {
            pattern = &pattern[..pattern.len() - 1];
            if new_slice.last().is_some_and(|s| s.is_empty()) {
                new_slice = &new_slice[..new_slice.len() - 1];
            }
            found = seek::seek_sequence(original_lines, pattern, line_index, chunk.is_end_of_file);
        }

        match found {
            Some(start_index) => {
                replacements.push(Replacement {
                    start_index,
                    old_len: pattern.len(),
                    new_lines: new_slice.to_vec(),
                });
                line_index = start_index + pattern.len();
            }
            None => {
                return Err(MatchError::Lines {
                    path: path.to_path_buf(),
                    old_lines: chunk.old_lines.clone(),
                });
            }
        }
    }

    Ok(replacements)
}

/// Apply replacements in descending start order so earlier edits do not shift
/// the indices of later ones.
fn apply_replacements(mut lines: Vec<String>, replacements: &[Replacement]) -> Vec<String> {
    let mut ordered: Vec<&Replacement> = replacements.iter().collect();
    ordered.sort_by_key(|r| r.start_index);
    for replacement in ordered.into_iter().rev() {
        let start_index = replacement.start_index;
        for _ in 0..replacement.old_len {
            if start_index < lines.len() {
                lines.remove(start_index);
            }
        }
        for (offset, new_line) in replacement.new_lines.iter().enumerate() {
            lines.insert(start_index + offset, new_line.clone());
        }
    }
    lines
}

/// The outcome of resolving an update hunk without writing it yet.
#[derive(Debug, Eq, PartialEq)]
pub struct ApplyPatchFileUpdate {
    pub unified_diff: String,
    pub content: String,
}

/// Resolve an update hunk against the file on disk and render the resulting
/// change as a unified diff, without modifying anything.
pub fn unified_diff_from_chunks(
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<ApplyPatchFileUpdate, ApplyPatchError> {
    unified_diff_from_chunks_with_context(path, chunks, 1)
}

pub fn unified_diff_from_chunks_with_context(
    path: &Path,
    chunks: &[UpdateFileChunk],
    context: usize,
) -> Result<ApplyPatchFileUpdate, ApplyPatchError> {
    let AppliedPatch {
        original_contents,
        new_contents,
    } = derive_new_contents_from_chunks(path, chunks)?;
    let text_diff = TextDiff::from_lines(&original_contents, &new_contents);
    let unified_diff = text_diff.unified_diff().context_radius(context).to_string();
    Ok(ApplyPatchFileUpdate {
        unified_diff,
        content: new_contents,
    })
}

/// Write the git-style summary of an applied patch.
pub fn print_summary(
    affected: &AffectedPaths,
    out: &mut impl std::io::Write,
) -> std::io::Result<()> {
    writeln!(out, "Success. Updated the following files:")?;
    for path in &affected.added {
        writeln!(out, "A {}", path.display())?;
    }
    for path in &affected.modified {
        writeln!(out, "M {}", path.display())?;
    }
    for path in &affected.deleted {
        writeln!(out, "D {}", path.display())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn wrap_patch(body: &str) -> String {
        format!("*** Begin Patch\n{body}\n*** End Patch")
    }

    fn strs_to_strings(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recognizes_literal_invocation() {
        let args = strs_to_strings(&[
            "apply_patch",
            r#"*** Begin Patch
*** Add File: foo
+hi
*** End Patch
"#,
        ]);

        match maybe_parse_apply_patch(&args) {
            MaybeApplyPatch::Body(hunks) => {
                assert_eq!(
                    hunks,
                    vec![Hunk::AddFile {
                        path: PathBuf::from("foo"),
                        contents: "hi\n".to_string()
                    }]
                );
            }
            result => panic!("expected MaybeApplyPatch::Body got {result:?}"),
        }
    }

    #[test]
    fn recognizes_heredoc_invocation() {
        let args = strs_to_strings(&[
            "bash",
            "-lc",
            r#"apply_patch <<'PATCH'
*** Begin Patch
*** Add File: foo
+hi
*** End Patch
PATCH"#,
        ]);

        match maybe_parse_apply_patch(&args) {
            MaybeApplyPatch::Body(hunks) => {
                assert_eq!(
                    hunks,
                    vec![Hunk::AddFile {
                        path: PathBuf::from("foo"),
                        contents: "hi\n".to_string()
                    }]
                );
            }
            result => panic!("expected MaybeApplyPatch::Body got {result:?}"),
        }
    }

    #[test]
    fn add_file_writes_contents_and_summary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("add.txt");
        let patch = wrap_patch(&format!(
            r#"*** Add File: {}
+ab
+cd"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        let stdout_str = String::from_utf8(stdout).unwrap();
        let stderr_str = String::from_utf8(stderr).unwrap();
        assert_eq!(
            stdout_str,
            format!("Success. Updated the following files:\nA {}\n", path.display())
        );
        assert_eq!(stderr_str, "");
        assert_eq!(fs::read_to_string(&path).unwrap(), "ab\ncd\n");
    }

    #[test]
    fn update_file_rewrites_matched_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.txt");
        fs::write(&path, "foo\nbar\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@
 foo
-bar
+baz"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        let stdout_str = String::from_utf8(stdout).unwrap();
        assert_eq!(
            stdout_str,
            format!("Success. Updated the following files:\nM {}\n", path.display())
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "foo\nbaz\n");
    }

    #[test]
    fn add_and_delete_in_one_patch() {
        let dir = tempdir().unwrap();
        let added = dir.path().join("added.txt");
        let doomed = dir.path().join("doomed.txt");
        fs::write(&doomed, "bye\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Add File: {}
+hello
*** Delete File: {}"#,
            added.display(),
            doomed.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        let stdout_str = String::from_utf8(stdout).unwrap();
        assert_eq!(
            stdout_str,
            format!(
                "Success. Updated the following files:\nA {}\nD {}\n",
                added.display(),
                doomed.display()
            )
        );
        assert_eq!(fs::read_to_string(&added).unwrap(), "hello\n");
        assert!(!doomed.exists());
    }

    #[test]
    fn update_with_move_renames_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("old.txt");
        let dest = dir.path().join("new.txt");
        fs::write(&src, "line one\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
*** Move to: {}
@@
-line one
+line 1"#,
            src.display(),
            dest.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "line 1\n");
    }

    #[test]
    fn pure_insertion_lands_before_trailing_blank() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("append.txt");
        fs::write(&path, "first\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@
+second"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn eof_anchored_chunk_matches_last_occurrence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tail.txt");
        fs::write(&path, "marker\nmiddle\nmarker\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@
-marker
+MARKER
*** End of File"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "marker\nmiddle\nMARKER\n");
    }

    #[test]
    fn missing_context_reports_stable_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx.txt");
        fs::write(&path, "alpha\nbeta\n").unwrap();
        let chunks = vec![UpdateFileChunk {
            change_context: Some("no such anchor".to_string()),
            old_lines: vec!["beta".to_string()],
            new_lines: vec!["gamma".to_string()],
            is_end_of_file: false,
        }];
        let err = derive_new_contents_from_chunks(&path, &chunks).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to find context 'no such anchor' in {}", path.display())
        );
    }

    #[test]
    fn missing_lines_report_stable_message() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        fs::write(&path, "alpha\nbeta\n").unwrap();
        let chunks = vec![UpdateFileChunk {
            change_context: None,
            old_lines: vec!["nope".to_string()],
            new_lines: vec!["never".to_string()],
            is_end_of_file: false,
        }];
        let err = derive_new_contents_from_chunks(&path, &chunks).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to find expected lines in {}", path.display())
        );
        match err {
            ApplyPatchError::MatchError(MatchError::Lines { old_lines, .. }) => {
                assert_eq!(old_lines, vec!["nope".to_string()]);
            }
            other => panic!("expected MatchError::Lines, got {other:?}"),
        }
    }

    #[test]
    fn unicode_punctuation_still_matches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unicode.txt");
        fs::write(&path, "a \u{2014} b\nkeep\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@
-a - b
+a -- b"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a -- b\nkeep\n");
    }

    #[test]
    fn exact_occurrence_is_preferred_over_fuzzy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exact.txt");
        fs::write(&path, "  value  \nvalue\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@
-value
+VALUE"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        // The verbatim second line is replaced; the padded first line stays.
        assert_eq!(fs::read_to_string(&path).unwrap(), "  value  \nVALUE\n");
    }

    #[test]
    fn multiple_chunks_apply_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.txt");
        fs::write(&path, "fn a() {\n    one\n}\nfn b() {\n    two\n}\n").unwrap();
        let patch = wrap_patch(&format!(
            r#"*** Update File: {}
@@ fn a() {{
-    one
+    ONE
@@ fn b() {{
-    two
+    TWO"#,
            path.display()
        ));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        apply_patch(&patch, &mut stdout, &mut stderr).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "fn a() {\n    ONE\n}\nfn b() {\n    TWO\n}\n"
        );
    }

    #[test]
    fn unified_diff_preview_reflects_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("diff.txt");
        fs::write(&path, "foo\nbar\n").unwrap();
        let chunks = vec![UpdateFileChunk {
            change_context: None,
            old_lines: vec!["bar".to_string()],
            new_lines: vec!["baz".to_string()],
            is_end_of_file: false,
        }];
        let update = unified_diff_from_chunks(&path, &chunks).unwrap();
        assert_eq!(update.content, "foo\nbaz\n");
        assert!(update.unified_diff.contains("-bar"));
        assert!(update.unified_diff.contains("+baz"));
        // Nothing was written.
        assert_eq!(fs::read_to_string(&path).unwrap(), "foo\nbar\n");
    }
}
