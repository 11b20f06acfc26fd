//! # Irreversible Block Quorum
//!
//! Every node that passed freshness and consistency this tick reports a
//! `(num, id)` pair for its last irreversible block. The canonical block
//! of the tick is picked by majority:
//!
//! 1. group claims by `num`
//! 2. score each group by its largest same-`id` subgroup
//! 3. the best scoring group wins, its most frequent `id` is canonical
//!
//! Ties go to whichever value was seen first, so the result depends only
//! on the order of the claims.

use std::fmt;

/// The irreversible block agreed on by the largest subset of nodes in one tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBlock {
    pub num: u64,
    pub id: String,
}

impl fmt::Display for CanonicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.num, self.id)
    }
}

/// `(value, occurrences)` in first-seen order.
fn tally<'a, I>(ids: I) -> Vec<(&'a str, usize)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for id in ids {
        match counts.iter_mut().find(|(seen, _)| *seen == id) {
            Some((_, count)) => *count += 1,
            None => counts.push((id, 1)),
        }
    }
    counts
}

/// Most frequent entry of a tally; the first one wins a tie.
fn most_frequent<'a>(counts: &[(&'a str, usize)]) -> Option<(&'a str, usize)> {
    counts.iter().fold(None, |best, &(id, count)| match best {
        Some((_, best_count)) if best_count >= count => best,
        _ => Some((id, count)),
    })
}

/// Computes the canonical irreversible block from `(num, id)` claims.
///
/// Returns `None` when there are no claims.
pub fn canonical_block<'a, I>(claims: I) -> Option<CanonicalBlock>
where
    I: IntoIterator<Item = (u64, &'a str)>,
{
    let mut groups: Vec<(u64, Vec<&'a str>)> = Vec::new();
    for (num, id) in claims {
        match groups.iter_mut().find(|(seen, _)| *seen == num) {
            Some((_, ids)) => ids.push(id),
            None => groups.push((num, vec![id])),
        }
    }

    let mut winner: Option<(u64, &'a str, usize)> = None;
    for (num, ids) in &groups {
        let counts = tally(ids.iter().copied());
        if let Some((id, count)) = most_frequent(&counts) {
            let better = match winner {
                Some((_, _, best)) => count > best,
                None => true,
            };
            if better {
                winner = Some((*num, id, count));
            }
        }
    }

    winner.map(|(num, id, _)| CanonicalBlock {
        num,
        id: id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_same_id_group_wins() {
        let claims = [(100, "A"), (100, "A"), (100, "B"), (99, "Z")];
        let canonical = canonical_block(claims).expect("claims present");
        assert_eq!(
            canonical,
            CanonicalBlock {
                num: 100,
                id: "A".to_string()
            }
        );
    }

    #[test]
    fn test_no_claims_no_canonical() {
        let claims: Vec<(u64, &str)> = Vec::new();
        assert_eq!(canonical_block(claims), None);
    }

    #[test]
    fn test_group_scored_by_agreement_not_size() {
        // 101 has three claims but only split ids; 100 has two agreeing.
        let claims = [(101, "X"), (101, "Y"), (101, "W"), (100, "A"), (100, "A")];
        let canonical = canonical_block(claims).expect("claims present");
        assert_eq!(canonical.num, 100);
        assert_eq!(canonical.id, "A");
    }

    #[test]
    fn test_ties_go_to_first_seen() {
        let claims = [(99, "Z"), (100, "A")];
        assert_eq!(canonical_block(claims).map(|c| c.num), Some(99));

        let claims = [(100, "B"), (100, "A")];
        assert_eq!(canonical_block(claims).map(|c| c.id), Some("B".to_string()));

        // Deterministic across repeated evaluation.
        let claims = [(7, "q"), (8, "r"), (7, "s"), (8, "r")];
        let first = canonical_block(claims);
        assert_eq!(first, canonical_block(claims));
        assert_eq!(first.map(|c| (c.num, c.id)), Some((8, "r".to_string())));
    }

    #[test]
    fn test_single_claim() {
        let canonical = canonical_block([(42, "only")]).expect("one claim");
        assert_eq!(canonical.to_string(), "#42 (only)");
    }
}
