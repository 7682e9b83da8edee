use chrono::{DateTime, Utc};

/// Shared wall-clock time base, always GMT.
///
/// Protocol code formats timestamps through a timebase so tests can pin the
/// clock and assert on rendered output.
#[derive(Clone, Default)]
pub struct Timebase {
    fixed: Option<DateTime<Utc>>,
}

impl Timebase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A timebase that always reports `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self { fixed: Some(at) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn fixed_timebase_is_stable() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let tb = Timebase::fixed(at);
        assert_eq!(tb.now(), at);
        assert_eq!(tb.now(), at);
    }
}
