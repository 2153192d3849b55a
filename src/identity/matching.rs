//! Deterministic team-name matching.
//!
//! Pure functions only. The resolvers decide what to do with a confidence
//! level; nothing here touches the store.

/// How strongly two team names agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchConfidence {
    None = 0,
    /// One name's words appear, in order, inside the other
    Contained = 1,
    /// Equal after normalization
    Exact = 2,
}

impl MatchConfidence {
    pub fn is_match(&self) -> bool {
        *self >= MatchConfidence::Contained
    }
}

/// Normalize a team name for comparison.
/// "Texas A&M Aggies" → "texas a and m aggies"
/// "St. John's (NY)" → "st john s ny"
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase().replace('&', " and ");
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split(' ').filter(|s| !s.is_empty()).collect()
}

/// True if `needle` occurs as a contiguous run of whole words in `haystack`.
fn contains_words(haystack: &[&str], needle: &[&str]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Compare two team names.
///
/// Containment is checked in both directions and on whole words, so
/// "Duke" is contained in "Duke Blue Devils" but "Kansas" is not contained
/// in "Arkansas".
pub fn match_names(a: &str, b: &str) -> MatchConfidence {
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na.is_empty() || nb.is_empty() {
        return MatchConfidence::None;
    }
    if na == nb {
        return MatchConfidence::Exact;
    }
    let ta = tokens(&na);
    let tb = tokens(&nb);
    if contains_words(&ta, &tb) || contains_words(&tb, &ta) {
        MatchConfidence::Contained
    } else {
        MatchConfidence::None
    }
}

/// True if `alias` is contained in `name` (not the reverse).
pub fn alias_within(alias: &str, name: &str) -> bool {
    let na = normalize_name(alias);
    let nn = normalize_name(name);
    contains_words(&tokens(&nn), &tokens(&na))
}

/// Number of words in the normalized name, used to try longer aliases first.
pub fn word_count(name: &str) -> usize {
    tokens(&normalize_name(name)).len()
}
