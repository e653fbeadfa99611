//! Accept balancing across reactor shards.
//!
//! Every shard registers the shared listener. When the listener becomes
//! readable, each woken shard asks the policy whether it may accept.
//! Counts are independent atomics read without a joint lock, so the
//! decision is advisory: two shards may briefly disagree, which only
//! skews the distribution by one connection.

use std::fmt;
use std::str::FromStr;

/// Policy choosing which shard accepts the next connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcceptBalance {
    /// Every woken shard races on `accept`
    #[default]
    Random,
    /// Shard `live_count % shard_count` accepts
    RoundRobin,
    /// The shard with the fewest connections accepts; ties go to the
    /// lowest shard id
    LeastConn,
}

impl AcceptBalance {
    /// Whether `shard` may accept right now.
    ///
    /// `live` is the registry's live connection count and `load(i)` the
    /// live count of shard `i`. With a single shard every policy admits.
    pub fn admits<F>(self, shard: usize, shard_count: usize, live: usize, load: F) -> bool
    where
        F: Fn(usize) -> usize,
    {
        if shard_count <= 1 {
            return true;
        }
        match self {
            AcceptBalance::Random => true,
            AcceptBalance::RoundRobin => shard == live % shard_count,
            AcceptBalance::LeastConn => {
                let mine = load(shard);
                (0..shard_count).filter(|&other| other != shard).all(|other| {
                    let theirs = load(other);
                    mine < theirs || (mine == theirs && shard < other)
                })
            }
        }
    }

    /// The shard the policy currently selects, or `None` when any shard
    /// may accept (`Random`).
    pub fn target<F>(self, shard_count: usize, live: usize, load: F) -> Option<usize>
    where
        F: Fn(usize) -> usize,
    {
        if shard_count == 0 {
            return None;
        }
        match self {
            AcceptBalance::Random => None,
            AcceptBalance::RoundRobin => Some(live % shard_count),
            AcceptBalance::LeastConn => (0..shard_count).min_by_key(|&i| (load(i), i)),
        }
    }
}

impl fmt::Display for AcceptBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptBalance::Random => write!(f, "random"),
            AcceptBalance::RoundRobin => write!(f, "round-robin"),
            AcceptBalance::LeastConn => write!(f, "least-conn"),
        }
    }
}

impl FromStr for AcceptBalance {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "random" => Ok(AcceptBalance::Random),
            "round-robin" | "roundrobin" | "rr" => Ok(AcceptBalance::RoundRobin),
            "least-conn" | "leastconn" | "lc" => Ok(AcceptBalance::LeastConn),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulate `accepts` sequential accepts; the admitted shard is the one
    /// the policy picks when every shard asks in id order.
    fn simulate(policy: AcceptBalance, shards: usize, accepts: usize) -> Vec<usize> {
        let mut counts = vec![0usize; shards];
        for _ in 0..accepts {
            let live: usize = counts.iter().sum();
            let winner = (0..shards)
                .find(|&s| policy.admits(s, shards, live, |i| counts[i]))
                .expect("some shard must be admitted");
            counts[winner] += 1;
        }
        counts
    }

    #[test]
    fn test_single_shard_always_admits() {
        for policy in [AcceptBalance::Random, AcceptBalance::RoundRobin, AcceptBalance::LeastConn] {
            assert!(policy.admits(0, 1, 17, |_| 17));
        }
    }

    #[test]
    fn test_round_robin_spreads_evenly() {
        let counts = simulate(AcceptBalance::RoundRobin, 4, 10);
        assert_eq!(counts, vec![3, 3, 2, 2]);
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_round_robin_admits_exactly_one() {
        for live in 0..12 {
            let admitted = (0..3)
                .filter(|&s| AcceptBalance::RoundRobin.admits(s, 3, live, |_| 0))
                .count();
            assert_eq!(admitted, 1);
        }
    }

    #[test]
    fn test_least_conn_ties_favor_lowest_id() {
        let counts = [2, 1, 1];
        assert!(!AcceptBalance::LeastConn.admits(0, 3, 4, |i| counts[i]));
        assert!(AcceptBalance::LeastConn.admits(1, 3, 4, |i| counts[i]));
        assert!(!AcceptBalance::LeastConn.admits(2, 3, 4, |i| counts[i]));
        assert_eq!(AcceptBalance::LeastConn.target(3, 4, |i| counts[i]), Some(1));
    }

    #[test]
    fn test_least_conn_stays_within_one() {
        let counts = simulate(AcceptBalance::LeastConn, 3, 100);
        let max = *counts.iter().max().unwrap();
        let min = *counts.iter().min().unwrap();
        assert!(max - min <= 1, "{:?}", counts);
    }

    #[test]
    fn test_target_matches_admits() {
        let counts = [5, 3, 4, 3];
        let live = counts.iter().sum();
        for policy in [AcceptBalance::RoundRobin, AcceptBalance::LeastConn] {
            let t = policy.target(4, live, |i| counts[i]).unwrap();
            assert!(policy.admits(t, 4, live, |i| counts[i]));
        }
        assert_eq!(AcceptBalance::Random.target(4, live, |i| counts[i]), None);
    }

    #[test]
    fn test_parse() {
        assert_eq!("round_robin".parse(), Ok(AcceptBalance::RoundRobin));
        assert_eq!("LeastConn".parse(), Ok(AcceptBalance::LeastConn));
        assert_eq!("random".parse(), Ok(AcceptBalance::Random));
        assert!("fastest".parse::<AcceptBalance>().is_err());
    }
}
