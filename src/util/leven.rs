//! Edit-distance field-name suggestions for schema validation diagnostics.
//!
//! No crate in the reference pack supplies Levenshtein distance, so this
//! is a small hand-rolled implementation local to the loader's use case
//! (suggesting the closest known field name for a typo'd key).

/// Classic Wagner-Fischer edit distance, O(len(a) * len(b)) time and
/// O(min(len(a), len(b))) space.
pub fn distance(a: &str, b: &str) -> usize {
    let (a, b): (Vec<char>, Vec<char>) = (a.chars().collect(), b.chars().collect());
    let (a, b) = if a.len() < b.len() { (b, a) } else { (a, b) };

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Return the candidate closest to `needle` by edit distance, if any
/// candidate is within a reasonable threshold (half the needle's length,
/// minimum 2).
pub fn closest<'a, I: IntoIterator<Item = &'a str>>(needle: &str, candidates: I) -> Option<&'a str> {
    let threshold = (needle.chars().count() / 2).max(2);
    candidates
        .into_iter()
        .map(|c| (c, distance(needle, c)))
        .filter(|(_, d)| *d <= threshold)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(distance("needs", "needs"), 0);
    }

    #[test]
    fn single_typo_has_distance_one() {
        assert_eq!(distance("need", "needs"), 1);
        assert_eq!(distance("strategi", "strategy"), 2);
    }

    #[test]
    fn closest_picks_nearest_field_name() {
        let fields = ["needs", "uses", "strategy", "rundir", "consumes"];
        assert_eq!(closest("stratgy", fields), Some("strategy"));
        assert_eq!(closest("need", fields), Some("needs"));
    }

    #[test]
    fn closest_returns_none_when_too_far() {
        let fields = ["needs", "uses", "strategy"];
        assert_eq!(closest("xyzxyzxyz", fields), None);
    }
}
