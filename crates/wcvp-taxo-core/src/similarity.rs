//! Ratcliff/Obershelp string similarity, the measure used to pick the closest
//! checklist name for a misspelled query.
//!
//! Scores are `2 * M / T` where `M` counts characters in matching blocks and
//! `T` is the combined length of both strings, so identical strings score
//! `1.0` and strings without a shared character score `0.0`.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Similarity a checklist name must reach before it replaces a query name.
pub const SIMILARITY_CUTOFF: f64 = 0.9;

/// Full Ratcliff/Obershelp ratio of two strings.
#[must_use]
pub fn ratio(lhs: &str, rhs: &str) -> f64 {
    let lhs = lhs.chars().collect::<Vec<_>>();
    let rhs = rhs.chars().collect::<Vec<_>>();
    score(matching_characters(&lhs, &rhs), lhs.len() + rhs.len())
}

/// Upper bound on [`ratio`] from the character multisets alone.
#[must_use]
pub fn quick_ratio(lhs: &str, rhs: &str) -> f64 {
    let mut available: HashMap<char, usize> = HashMap::new();
    let mut rhs_len = 0_usize;
    for ch in rhs.chars() {
        *available.entry(ch).or_default() += 1;
        rhs_len += 1;
    }

    let mut lhs_len = 0_usize;
    let mut matches = 0_usize;
    for ch in lhs.chars() {
        lhs_len += 1;
        if let Some(count) = available.get_mut(&ch) {
            if *count > 0 {
                *count -= 1;
                matches += 1;
            }
        }
    }

    score(matches, lhs_len + rhs_len)
}

/// Upper bound on [`ratio`] from the string lengths alone.
#[must_use]
pub fn real_quick_ratio(lhs: &str, rhs: &str) -> f64 {
    let lhs_len = lhs.chars().count();
    let rhs_len = rhs.chars().count();
    score(lhs_len.min(rhs_len), lhs_len + rhs_len)
}

/// Return the candidate most similar to `query` with a ratio of at least
/// `cutoff`, or `None` when nothing qualifies.
///
/// Each candidate is scored as the first sequence against `query`, and equal
/// scores go to the lexicographically greatest name. This reproduces the
/// ranking of Python's `difflib.get_close_matches(word, candidates, n=1)`.
pub fn best_match<'a, I>(query: &str, candidates: I, cutoff: f64) -> Option<(&'a str, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let floor = best.map_or(cutoff, |(_, score)| score.max(cutoff));
        if real_quick_ratio(candidate, query) < floor || quick_ratio(candidate, query) < floor {
            continue;
        }

        let candidate_score = ratio(candidate, query);
        if candidate_score < cutoff {
            continue;
        }
        let improves = match best {
            Some((name, score)) => match candidate_score.partial_cmp(&score) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => candidate > name,
                _ => false,
            },
            None => true,
        };
        if improves {
            best = Some((candidate, candidate_score));
        }
    }
    best
}

#[allow(clippy::cast_precision_loss)]
fn score(matches: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    2.0 * matches as f64 / total as f64
}

fn matching_characters(lhs: &[char], rhs: &[char]) -> usize {
    let (lhs_start, rhs_start, size) = longest_common_block(lhs, rhs);
    if size == 0 {
        return 0;
    }

    size + matching_characters(&lhs[..lhs_start], &rhs[..rhs_start])
        + matching_characters(&lhs[lhs_start + size..], &rhs[rhs_start + size..])
}

// Earliest start in `lhs` wins among equally long blocks, then earliest in `rhs`.
fn longest_common_block(lhs: &[char], rhs: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut previous = vec![0_usize; rhs.len() + 1];
    let mut current = vec![0_usize; rhs.len() + 1];

    for (lhs_index, lhs_char) in lhs.iter().enumerate() {
        for (rhs_index, rhs_char) in rhs.iter().enumerate() {
            current[rhs_index + 1] =
                if lhs_char == rhs_char { previous[rhs_index] + 1 } else { 0 };
            let run = current[rhs_index + 1];
            if run > best.2 {
                best = (lhs_index + 1 - run, rhs_index + 1 - run, run);
            }
        }
        std::mem::swap(&mut previous, &mut current);
    }

    best
}
