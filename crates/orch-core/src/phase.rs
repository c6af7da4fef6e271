//! Self-reported phase markers (`Phase: Complete`) written by agents.

/// Terminal phase an agent reports when it considers its task finished.
pub const COMPLETE_PHASE: &str = "Complete";

/// Extract the phase word from a single `Phase: <word>` line.
///
/// Markdown decoration (`**Phase:**`, list bullets, headings, quotes) is
/// tolerated; the key is matched case-insensitively.
pub fn parse_phase_line(line: &str) -> Option<String> {
    let cleaned: String = line.chars().filter(|ch| *ch != '*' && *ch != '`').collect();
    let cleaned = cleaned
        .trim_start_matches(|ch: char| ch == '#' || ch == '-' || ch == '>' || ch.is_whitespace());

    let key = cleaned.get(..6)?;
    if !key.eq_ignore_ascii_case("phase:") {
        return None;
    }

    let word = cleaned[6..]
        .split_whitespace()
        .next()?
        .trim_end_matches(|ch: char| !ch.is_alphanumeric());
    if word.is_empty() {
        None
    } else {
        Some(word.to_string())
    }
}

/// The last phase reported anywhere in `text`.
pub fn latest_phase(text: &str) -> Option<String> {
    text.lines().filter_map(parse_phase_line).last()
}

pub fn is_complete_phase(phase: &str) -> bool {
    phase.eq_ignore_ascii_case(COMPLETE_PHASE)
}
