//! Repository maintenance decisions: forget policy, prune and unlock

use chrono::{DateTime, Duration, Utc};

use crate::crd::ResticRetainPolicy;

/// Days between prunes when `pruneIntervalDays` is not set
pub const DEFAULT_PRUNE_INTERVAL_DAYS: i32 = 7;

/// `restic forget` options for a retention policy
///
/// Without a policy only the most recent snapshot is kept.
pub fn generate_forget_options(policy: Option<&ResticRetainPolicy>) -> String {
    const DEFAULT: &str = "--keep-last 1";
    let Some(policy) = policy else {
        return DEFAULT.to_string();
    };

    let mut options = String::new();
    for (flag, value) in [
        ("--keep-hourly", policy.hourly),
        ("--keep-daily", policy.daily),
        ("--keep-weekly", policy.weekly),
        ("--keep-monthly", policy.monthly),
        ("--keep-yearly", policy.yearly),
    ] {
        if let Some(n) = value {
            options.push_str(&format!(" {} {}", flag, n));
        }
    }
    if let Some(within) = policy.within.as_deref().filter(|w| !w.is_empty()) {
        options.push_str(&format!(" --keep-within {}", within));
    }

    if options.is_empty() {
        DEFAULT.to_string()
    } else {
        options.trim().to_string()
    }
}

/// Whether the repository is due for a prune at `now`
///
/// The interval runs from the last prune, or from the source's creation
/// when it has never pruned.
pub fn should_prune(
    prune_interval_days: Option<i32>,
    last_pruned: Option<DateTime<Utc>>,
    created: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let interval = Duration::days(i64::from(
        prune_interval_days.unwrap_or(DEFAULT_PRUNE_INTERVAL_DAYS),
    ));
    match last_pruned.or(created) {
        Some(base) => base + interval < now,
        None => false,
    }
}

/// Whether a new unlock was requested since the last one ran
pub fn should_unlock(unlock: Option<&str>, last_unlocked: Option<&str>) -> bool {
    match unlock {
        Some(u) if !u.is_empty() => last_unlocked != Some(u),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_policy_keeps_last() {
        assert_eq!(generate_forget_options(None), "--keep-last 1");
        assert_eq!(
            generate_forget_options(Some(&ResticRetainPolicy::default())),
            "--keep-last 1"
        );
    }

    #[test]
    fn test_full_policy() {
        let policy = ResticRetainPolicy {
            hourly: Some(1),
            daily: Some(2),
            weekly: Some(3),
            monthly: Some(4),
            yearly: Some(5),
            ..Default::default()
        };
        assert_eq!(
            generate_forget_options(Some(&policy)),
            "--keep-hourly 1 --keep-daily 2 --keep-weekly 3 --keep-monthly 4 --keep-yearly 5"
        );
    }

    #[test]
    fn test_within_only() {
        let policy = ResticRetainPolicy {
            within: Some("5d".into()),
            ..Default::default()
        };
        assert_eq!(generate_forget_options(Some(&policy)), "--keep-within 5d");
    }

    #[test]
    fn test_every_field_set_drops_the_default() {
        let policy = ResticRetainPolicy {
            hourly: Some(1),
            daily: Some(2),
            weekly: Some(3),
            monthly: Some(4),
            yearly: Some(5),
            within: Some("3d4h".into()),
        };
        let options = generate_forget_options(Some(&policy));
        assert!(!options.contains("--keep-last"));
        assert_eq!(
            options,
            "--keep-hourly 1 --keep-daily 2 --keep-weekly 3 --keep-monthly 4 --keep-yearly 5 \
             --keep-within 3d4h"
        );
    }

    #[test]
    fn test_prune_measured_from_creation() {
        let created = Utc::now();
        assert!(!should_prune(None, None, Some(created), created + Duration::days(6)));
        assert!(!should_prune(None, None, Some(created), created + Duration::days(7)));
        assert!(should_prune(None, None, Some(created), created + Duration::days(8)));
        assert!(should_prune(Some(1), None, Some(created), created + Duration::hours(25)));
    }

    #[test]
    fn test_prune_measured_from_last_prune() {
        let created = Utc::now();
        let pruned = created + Duration::days(10);
        assert!(!should_prune(None, Some(pruned), Some(created), pruned + Duration::days(3)));
        assert!(should_prune(None, Some(pruned), Some(created), pruned + Duration::days(8)));
    }

    #[test]
    fn test_unlock_only_when_changed() {
        assert!(!should_unlock(None, None));
        assert!(!should_unlock(Some(""), None));
        assert!(should_unlock(Some("a"), None));
        assert!(!should_unlock(Some("a"), Some("a")));
        assert!(should_unlock(Some("b"), Some("a")));
    }
}
