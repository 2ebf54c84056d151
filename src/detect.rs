//! Keyword detection over transcript text.

use log::warn;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Keyword, MatchType};

/// Chars of context kept around a match on each side.
pub const SEGMENT_RADIUS: usize = 300;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword_id: Uuid,
    pub phrase: String,
    /// The verbatim substring at the match site, original casing preserved.
    pub matched_text: String,
    pub transcript_segment: String,
}

/// Scans the transcript once per keyword under its match policy. Matches
/// within one keyword are non-overlapping; output order is keywords in input
/// order, matches in ascending position. A keyword whose pattern does not
/// compile is skipped, never failing the episode.
pub fn detect_keywords(transcript: &str, keywords: &[Keyword]) -> Vec<KeywordMatch> {
    let mut matches = Vec::new();

    for keyword in keywords {
        let pattern = match keyword.match_type {
            MatchType::Contains => regex::escape(&keyword.phrase),
            MatchType::ExactWord => format!(r"\b{}\b", regex::escape(&keyword.phrase)),
            MatchType::Regex => keyword.phrase.clone(),
        };
        let regex = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
            Ok(regex) => regex,
            Err(err) => {
                warn!("invalid pattern for keyword '{}': {err}", keyword.phrase);
                continue;
            }
        };

        for found in regex.find_iter(transcript) {
            matches.push(KeywordMatch {
                keyword_id: keyword.id,
                phrase: keyword.phrase.clone(),
                matched_text: found.as_str().to_string(),
                transcript_segment: extract_segment(transcript, found.start(), found.end()),
            });
        }
    }

    matches
}

/// `text[max(0, start-radius)..min(len, end+radius)]` measured in
/// characters, with `...` affixed on any side that was truncated. The window
/// is a character count, so multibyte transcripts get the same amount of
/// context as ASCII ones.
pub fn extract_segment(text: &str, match_start: usize, match_end: usize) -> String {
    let seg_start = chars_back(text, match_start, SEGMENT_RADIUS);
    let seg_end = chars_forward(text, match_end, SEGMENT_RADIUS);

    let prefix = if seg_start > 0 { "..." } else { "" };
    let suffix = if seg_end < text.len() { "..." } else { "" };
    format!("{prefix}{}{suffix}", &text[seg_start..seg_end])
}

/// Byte index `count` characters before `from` (a char boundary), clamped to
/// the start of the text.
fn chars_back(text: &str, from: usize, count: usize) -> usize {
    text[..from]
        .char_indices()
        .rev()
        .take(count)
        .last()
        .map_or(from, |(index, _)| index)
}

/// Byte index `count` characters after `from`, clamped to the end.
fn chars_forward(text: &str, from: usize, count: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(count)
        .map_or(text.len(), |(index, _)| from + index)
}
