use chrono::Utc;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Point in time with nanosecond precision, always normalized so that
/// `0 <= nanos < 1e9`. Field order gives the derived chronological ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let total = i128::from(seconds) * i128::from(NANOS_PER_SECOND) + i128::from(nanos);
        let nanos_per_second = i128::from(NANOS_PER_SECOND);
        Self {
            seconds: total.div_euclid(nanos_per_second) as i64,
            nanos: total.rem_euclid(nanos_per_second) as i32,
        }
    }

    /// Local wall-clock time, used for local write times.
    pub fn now() -> Self {
        let now = Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos() as i32)
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + i64::from(self.nanos / 1_000)
    }

    pub fn canonical_id(&self) -> String {
        format!("time({},{})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_and_negative_nanos() {
        assert_eq!(Timestamp::new(1, 1_500_000_000), Timestamp { seconds: 2, nanos: 500_000_000 });
        assert_eq!(Timestamp::new(0, -1), Timestamp { seconds: -1, nanos: 999_999_999 });
    }

    #[test]
    fn orders_by_seconds_then_nanos() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(1, 6));
        assert!(Timestamp::new(1, 999) < Timestamp::new(2, 0));
    }

    #[test]
    fn micros_truncate_nanos() {
        assert_eq!(Timestamp::new(1, 2_999).to_micros(), 1_000_002);
    }
}
