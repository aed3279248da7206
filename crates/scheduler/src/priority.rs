//! Urgency banding — coarse priority tiers derived from anchor proximity.

use chrono::{DateTime, Utc};

/// Band for executions with no anchor date, and the lowest priority tier.
pub const DEFAULT_BAND: u8 = 3;

/// Derive the urgency band from how close the anchor date is.
///
/// An anchor within a day (or already past) is band 0; within a week band 1;
/// within a month band 2; anything further out, or no anchor at all, band 3.
pub fn urgency_band(anchor_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u8 {
    let anchor = match anchor_date {
        Some(anchor) => anchor,
        None => return DEFAULT_BAND,
    };
    let days_until = (anchor - now).num_days();
    if days_until <= 1 {
        0
    } else if days_until <= 7 {
        1
    } else if days_until <= 30 {
        2
    } else {
        DEFAULT_BAND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_banding_thresholds() {
        let now = Utc::now();
        assert_eq!(urgency_band(None, now), 3);
        assert_eq!(urgency_band(Some(now + Duration::hours(6)), now), 0);
        assert_eq!(urgency_band(Some(now - Duration::days(2)), now), 0);
        assert_eq!(urgency_band(Some(now + Duration::days(5)), now), 1);
        assert_eq!(urgency_band(Some(now + Duration::days(21)), now), 2);
        assert_eq!(urgency_band(Some(now + Duration::days(90)), now), 3);
    }
}
