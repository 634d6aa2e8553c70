//! Vote arithmetic over a committee of `n` miners.
//!
//! Commit and abort thresholds never overlap: `for + against <= n` and
//! `for > n/2` together force `against < (n + 2) / 2`.

/// A proposal commits once strictly more than half the committee voted for it.
pub fn commit_reached(votes_for: usize, n: usize) -> bool {
    votes_for > n / 2
}

/// A proposal fails once `ceil((n + 1) / 2)` members voted against it.
pub fn abort_reached(votes_against: usize, n: usize) -> bool {
    votes_against >= abort_threshold(n)
}

pub fn abort_threshold(n: usize) -> usize {
    (n + 2) / 2
}

/// A bidder becomes leader when its own vote plus the affirmative acks
/// exceed half the committee.
pub fn leadership_reached(acks: usize, n: usize) -> bool {
    1 + acks > n / 2
}

/// Valid signatures a committed block needs, given the committee that
/// was in force at its parent.
pub fn certification_threshold(n: usize) -> usize {
    (n + 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_mutually_exclusive() {
        for n in 1..=32 {
            for votes_for in 0..=n {
                for votes_against in 0..=(n - votes_for) {
                    assert!(
                        !(commit_reached(votes_for, n) && abort_reached(votes_against, n)),
                        "n={n} for={votes_for} against={votes_against}"
                    );
                }
            }
        }
    }

    #[test]
    fn four_miners_need_three_either_way() {
        assert!(!commit_reached(2, 4));
        assert!(commit_reached(3, 4));
        assert!(!abort_reached(2, 4));
        assert!(abort_reached(3, 4));
    }

    #[test]
    fn even_split_never_resolves() {
        for n in (2..=16).step_by(2) {
            assert!(!commit_reached(n / 2, n));
            assert!(!abort_reached(n / 2, n));
        }
    }

    #[test]
    fn odd_committee() {
        assert!(commit_reached(3, 5));
        assert!(!commit_reached(2, 5));
        assert!(abort_reached(3, 5));
        assert!(!abort_reached(2, 5));
    }

    #[test]
    fn lone_miner_commits_on_its_own_vote() {
        assert!(commit_reached(1, 1));
        assert!(commit_reached(1, 0));
        assert!(leadership_reached(0, 1));
    }

    #[test]
    fn leadership_counts_self() {
        assert!(!leadership_reached(1, 4));
        assert!(leadership_reached(2, 4));
        assert!(leadership_reached(2, 5));
        assert!(!leadership_reached(1, 5));
    }

    #[test]
    fn certification_needs_half_rounded_up() {
        assert_eq!(certification_threshold(1), 1);
        assert_eq!(certification_threshold(4), 2);
        assert_eq!(certification_threshold(5), 3);
    }
}
