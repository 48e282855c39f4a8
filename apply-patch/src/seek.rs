/// Attempt to find the sequence of `pattern` lines within `lines`, beginning
/// at or after `start`. Returns the starting index of the match or `None`.
///
/// Matching is attempted with decreasing strictness: exact match, then
/// ignoring trailing whitespace, then ignoring leading and trailing
/// whitespace, then with Unicode punctuation (dashes, quotes, exotic spaces)
/// folded to their ASCII counterparts. A stricter tier always wins over a
/// looser one, so a pattern that occurs verbatim is matched verbatim.
///
/// When `eof` is true the search starts at the end of the file (patterns
/// anchored to the file ending are applied there), falling back to `start`.
///
/// Special cases:
///  • empty `pattern` → `Some(start)` (no-op match)
///  • `pattern.len() > lines.len()` → `None`
pub(crate) fn seek_sequence(
    lines: &[String],
    pattern: &[String],
    start: usize,
    eof: bool,
) -> Option<usize> {
    if pattern.is_empty() {
        return Some(start);
    }
    if pattern.len() > lines.len() {
        return None;
    }
    let search_start = if eof && lines.len() >= pattern.len() {
        lines.len() - pattern.len()
    } else {
        start
    };

    let tiers: [fn(&str, &str) -> bool; 4] = [
        |line, pat| line == pat,
        |line, pat| line.trim_end() == pat.trim_end(),
        |line, pat| line.trim() == pat.trim(),
        |line, pat| normalize_line(line.trim()) == normalize_line(pat.trim()),
    ];
    for lines_match in tiers {
        for i in search_start..=lines.len().saturating_sub(pattern.len()) {
            if pattern
                .iter()
                .enumerate()
                .all(|(p_idx, pat)| lines_match(&lines[i + p_idx], pat))
            {
                return Some(i);
            }
        }
    }
    None
}

/// Fold typographic dashes, quotes, and non-standard space characters into
/// their ASCII equivalents so that patches produced against rendered text
/// still land on source that uses plain punctuation (and vice versa).
fn normalize_line(line: &str) -> String {
    line.chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{00AB}' | '\u{00BB}' => '"',
            '\u{00A0}' | '\u{1680}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}'
            | '\u{3000}' => ' ',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::normalize_line;
    use super::seek_sequence;

    fn to_vec(strings: &[&str]) -> Vec<String> {
        strings.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match_finds_sequence() {
        let lines = to_vec(&["foo", "bar", "baz"]);
        let pattern = to_vec(&["bar", "baz"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), Some(1));
    }

    #[test]
    fn rstrip_match_ignores_trailing_whitespace() {
        let lines = to_vec(&["foo   ", "bar\t\t"]);
        let pattern = to_vec(&["foo", "bar"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), Some(0));
    }

    #[test]
    fn trim_match_ignores_leading_and_trailing_whitespace() {
        let lines = to_vec(&["    foo   ", "   bar\t"]);
        let pattern = to_vec(&["foo", "bar"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), Some(0));
    }

    #[test]
    fn unicode_punctuation_folds_to_ascii() {
        let lines = to_vec(&["a \u{2014} b", "it\u{2019}s \u{201C}quoted\u{201D}"]);
        let pattern = to_vec(&["a - b", "it's \"quoted\""]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), Some(0));
        // Non-breaking space folds too.
        assert_eq!(normalize_line("x\u{00A0}y"), "x y");
    }

    #[test]
    fn exact_occurrence_wins_over_fuzzy_candidates() {
        // An earlier line that would match after trimming must not shadow a
        // later verbatim occurrence.
        let lines = to_vec(&["  target  ", "target"]);
        let pattern = to_vec(&["target"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), Some(1));
    }

    #[test]
    fn pattern_longer_than_input_returns_none() {
        let lines = to_vec(&["just one line"]);
        let pattern = to_vec(&["too", "many", "lines"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, false), None);
    }

    #[test]
    fn eof_anchored_pattern_matches_file_ending() {
        let lines = to_vec(&["head", "mid", "tail"]);
        let pattern = to_vec(&["tail"]);
        assert_eq!(seek_sequence(&lines, &pattern, 0, true), Some(2));
    }
}
