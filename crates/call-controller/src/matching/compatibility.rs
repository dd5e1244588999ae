//! Compatibility rules for pairing queued requests.
//!
//! All rules must hold for a pair to match:
//! 1. The requests originate from different communities.
//! 2. The requests were not initiated by the same user.
//! 3. The two initiators have no recent-match record inside the cooldown
//!    window (checked against the store by the engine, not here).
//! 4. Age compatibility: when the two queue times differ by more than the
//!    gap threshold, pairing is only allowed once the older request has
//!    waited past the grace period - fresh requests are not forced onto
//!    very stale ones before the stale one is considered desperate.

use crate::config::MatchingConfig;
use crate::models::CallRequest;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::UserId;

/// Store key for a user pair's recent-match cooldown entry. Order
/// independent: both orderings of the pair map to the same key.
#[must_use]
pub fn cooldown_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("cooldown:{lo}:{hi}")
}

/// The synchronous compatibility rules (community, initiator, age).
///
/// The cooldown rule needs a store round-trip and is applied by the
/// engine after these pass.
#[must_use]
pub fn rules_allow(
    a: &CallRequest,
    b: &CallRequest,
    now: DateTime<Utc>,
    config: &MatchingConfig,
) -> bool {
    if a.guild_id == b.guild_id {
        return false;
    }
    if a.initiator_id == b.initiator_id {
        return false;
    }
    age_compatible(a, b, now, config)
}

fn age_compatible(
    a: &CallRequest,
    b: &CallRequest,
    now: DateTime<Utc>,
    config: &MatchingConfig,
) -> bool {
    let gap = (a.queued_at - b.queued_at).abs();
    let threshold = ChronoDuration::from_std(config.age_gap_threshold)
        .unwrap_or(ChronoDuration::MAX);
    if gap <= threshold {
        return true;
    }

    let older = a.queued_at.min(b.queued_at);
    let grace =
        ChronoDuration::from_std(config.age_grace_period).unwrap_or(ChronoDuration::MAX);
    now - older >= grace
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::fixtures::TestRequest;
    use std::time::Duration;

    fn config() -> MatchingConfig {
        MatchingConfig {
            sweep_interval: Duration::from_secs(1),
            cooldown: Duration::from_secs(300),
            age_gap_threshold: Duration::from_secs(300),
            age_grace_period: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_cooldown_key_is_order_independent() {
        assert_eq!(
            cooldown_key(UserId(5), UserId(9)),
            cooldown_key(UserId(9), UserId(5))
        );
        assert_eq!(cooldown_key(UserId(5), UserId(9)), "cooldown:5:9");
    }

    #[test]
    fn test_same_guild_never_matches() {
        let a = TestRequest::for_channel(1).guild(7).initiator(100).build();
        let b = TestRequest::for_channel(2).guild(7).initiator(200).build();
        assert!(!rules_allow(&a, &b, Utc::now(), &config()));
    }

    #[test]
    fn test_same_initiator_never_matches() {
        let a = TestRequest::for_channel(1).guild(7).initiator(100).build();
        let b = TestRequest::for_channel(2).guild(8).initiator(100).build();
        assert!(!rules_allow(&a, &b, Utc::now(), &config()));
    }

    #[test]
    fn test_compatible_pair_matches() {
        let a = TestRequest::for_channel(1).guild(7).initiator(100).build();
        let b = TestRequest::for_channel(2).guild(8).initiator(200).build();
        assert!(rules_allow(&a, &b, Utc::now(), &config()));
    }

    #[test]
    fn test_age_gap_blocks_fresh_vs_stale() {
        // Stale request queued 7 minutes ago, fresh one just now: the gap
        // exceeds the 5 minute threshold and the stale one has not yet
        // waited out the 10 minute grace period.
        let stale = TestRequest::for_channel(1)
            .guild(7)
            .initiator(100)
            .queued_secs_ago(420)
            .build();
        let fresh = TestRequest::for_channel(2).guild(8).initiator(200).build();

        assert!(!rules_allow(&stale, &fresh, Utc::now(), &config()));
    }

    #[test]
    fn test_age_gap_allows_desperate_request() {
        // Past the grace period the stale request pairs with anyone.
        let stale = TestRequest::for_channel(1)
            .guild(7)
            .initiator(100)
            .queued_secs_ago(700)
            .build();
        let fresh = TestRequest::for_channel(2).guild(8).initiator(200).build();

        assert!(rules_allow(&stale, &fresh, Utc::now(), &config()));
    }

    #[test]
    fn test_small_age_gap_always_allowed() {
        let a = TestRequest::for_channel(1)
            .guild(7)
            .initiator(100)
            .queued_secs_ago(200)
            .build();
        let b = TestRequest::for_channel(2).guild(8).initiator(200).build();

        // 200s gap is under the 300s threshold
        assert!(rules_allow(&a, &b, Utc::now(), &config()));
    }

    #[test]
    fn test_rule_symmetry() {
        let stale = TestRequest::for_channel(1)
            .guild(7)
            .initiator(100)
            .queued_secs_ago(420)
            .build();
        let fresh = TestRequest::for_channel(2).guild(8).initiator(200).build();
        let now = Utc::now();

        assert_eq!(
            rules_allow(&stale, &fresh, now, &config()),
            rules_allow(&fresh, &stale, now, &config())
        );
    }
}
