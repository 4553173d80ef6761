use rand::Rng;
use std::time::Duration;

/// How long a follower waits without hearing from a leader before starting
/// an election. Randomized per reset so concurrent timeouts diverge.
pub fn follower_timeout(base_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(base_ms + rng.gen_range(0..=base_ms))
}

/// How long a candidate waits before retrying a failed election. Grows with
/// the attempt count so competing candidates fall out of lockstep.
pub fn candidate_timeout(base_ms: u64, attempt: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let scaled = (base_ms * attempt.max(1)) as f64 * rng.gen_range(1.0..2.0);
    Duration::from_millis(scaled as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follower_timeout_within_jitter_range() {
        for _ in 0..100 {
            let t = follower_timeout(100);
            assert!(t >= Duration::from_millis(100));
            assert!(t <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_candidate_timeout_scales_with_attempt() {
        for _ in 0..100 {
            let t = candidate_timeout(50, 3);
            assert!(t >= Duration::from_millis(150));
            assert!(t < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_candidate_timeout_attempt_zero_treated_as_one() {
        let t = candidate_timeout(50, 0);
        assert!(t >= Duration::from_millis(50));
    }
}
