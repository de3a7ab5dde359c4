//! Timer identity and the notification snapshot handed to consumers.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimerError};

/// Identifier of a timer, unique within one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimerId(String);

impl TimerId {
    /// Validate and wrap an id.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidTimer`] if the id is empty or contains
    /// control characters.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(TimerError::invalid_timer("timer id must not be empty"));
        }
        if id.chars().any(char::is_control) {
            return Err(TimerError::invalid_timer(format!(
                "timer id {id:?} contains control characters"
            )));
        }
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TimerId {
    type Error = TimerError;

    fn try_from(id: String) -> Result<Self> {
        Self::parse(id)
    }
}

impl From<TimerId> for String {
    fn from(id: TimerId) -> Self {
        id.0
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-shot timer: fire at `deadline`, delivering `context` verbatim.
///
/// Deadlines have second resolution. Sub-second instants are rounded up to
/// the next whole second so a timer is never delivered early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    id: TimerId,
    context: String,
    deadline: DateTime<Utc>,
}

impl Timer {
    /// Create a timer firing at an absolute instant.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidTimer`] if the id is invalid.
    pub fn new(
        id: impl Into<String>,
        context: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: TimerId::parse(id)?,
            context: context.into(),
            deadline: ceil_to_second(deadline),
        })
    }

    /// Create a timer firing `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidTimer`] if the id is invalid or the
    /// deadline is out of range.
    pub fn after(id: impl Into<String>, context: impl Into<String>, delay: Duration) -> Result<Self> {
        let deadline = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .ok_or_else(|| TimerError::invalid_timer(format!("delay {delay:?} out of range")))?;
        Self::new(id, context, deadline)
    }

    /// Rebuild a fired timer from its stored parts.
    ///
    /// Returns `None` if the score is not a representable instant.
    #[must_use]
    pub fn from_parts(id: TimerId, context: String, deadline_secs: i64) -> Option<Self> {
        DateTime::from_timestamp(deadline_secs, 0).map(|deadline| Self {
            id,
            context,
            deadline,
        })
    }

    /// Get the timer ID.
    #[must_use]
    pub fn id(&self) -> &TimerId {
        &self.id
    }

    /// Get the opaque context payload.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Get the deadline.
    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Deadline as seconds since the Unix epoch, the ordered-set score.
    #[must_use]
    pub fn deadline_secs(&self) -> i64 {
        self.deadline.timestamp()
    }

    /// Lifetime of the context record: time left until the deadline
    /// (never negative) plus `margin`.
    #[must_use]
    pub fn context_ttl(&self, now: DateTime<Utc>, margin: Duration) -> Duration {
        self.deadline
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_add(margin)
    }

    /// Consume the timer, returning the context payload.
    #[must_use]
    pub fn into_context(self) -> String {
        self.context
    }
}

/// Round an instant up to the next whole second.
fn ceil_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.timestamp_subsec_nanos() == 0 {
        return at;
    }
    DateTime::from_timestamp(at.timestamp().saturating_add(1), 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn at(secs: i64, nanos: u32) -> std::result::Result<DateTime<Utc>, &'static str> {
        DateTime::from_timestamp(secs, nanos).ok_or("timestamp out of range")
    }

    #[test]
    fn test_timer_id_rejects_empty() {
        assert!(matches!(
            TimerId::parse(""),
            Err(TimerError::InvalidTimer { .. })
        ));
    }

    #[test]
    fn test_timer_id_rejects_control_characters() {
        assert!(TimerId::parse("abc\n").is_err());
        assert!(TimerId::parse("a\u{0}b").is_err());
    }

    #[test]
    fn test_timer_id_accepts_spaces_and_unicode() -> TestResult {
        assert_eq!(TimerId::parse("order 42 ✓")?.as_str(), "order 42 ✓");
        Ok(())
    }

    #[test]
    fn test_timer_id_display() -> TestResult {
        let id = TimerId::parse("order-42")?;
        assert_eq!(format!("{id}"), "order-42");
        Ok(())
    }

    #[test]
    fn test_timer_id_deserialization_validates() {
        let ok: std::result::Result<TimerId, _> = serde_json::from_str("\"t-1\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<TimerId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_deadline_rounds_up() -> TestResult {
        let requested = at(1_700_000_000, 250_000_000)?;
        let timer = Timer::new("t", "ctx", requested)?;
        assert_eq!(timer.deadline_secs(), 1_700_000_001);
        assert!(timer.deadline() >= requested);
        Ok(())
    }

    #[test]
    fn test_whole_second_deadline_unchanged() -> TestResult {
        let requested = at(1_700_000_000, 0)?;
        let timer = Timer::new("t", "ctx", requested)?;
        assert_eq!(timer.deadline(), requested);
        Ok(())
    }

    #[test]
    fn test_context_ttl_future_deadline() -> TestResult {
        let timer = Timer::new("t", "ctx", at(1_030, 0)?)?;
        let ttl = timer.context_ttl(at(1_000, 0)?, Duration::from_secs(600));
        assert_eq!(ttl, Duration::from_secs(630));
        Ok(())
    }

    #[test]
    fn test_context_ttl_past_deadline_is_margin() -> TestResult {
        let timer = Timer::new("t", "ctx", at(970, 0)?)?;
        let ttl = timer.context_ttl(at(1_000, 0)?, Duration::from_secs(600));
        assert_eq!(ttl, Duration::from_secs(600));
        Ok(())
    }

    #[test]
    fn test_context_ttl_saturates() -> TestResult {
        let timer = Timer::new("t", "ctx", at(2_000, 0)?)?;
        let ttl = timer.context_ttl(at(1_000, 0)?, Duration::MAX);
        assert_eq!(ttl, Duration::MAX);
        Ok(())
    }

    #[test]
    fn test_timer_after_is_in_future() -> TestResult {
        let earliest = Utc::now()
            .checked_add_signed(TimeDelta::seconds(5))
            .ok_or("clock overflow")?;
        let timer = Timer::after("t", "ctx", Duration::from_secs(5))?;
        assert!(timer.deadline() >= earliest);
        Ok(())
    }

    #[test]
    fn test_timer_after_rejects_huge_delay() {
        assert!(matches!(
            Timer::after("t", "ctx", Duration::MAX),
            Err(TimerError::InvalidTimer { .. })
        ));
    }

    #[test]
    fn test_from_parts() -> TestResult {
        let timer = Timer::from_parts(TimerId::parse("t")?, "ctx".to_string(), 42)
            .ok_or("score 42 rejected")?;
        assert_eq!(timer.deadline_secs(), 42);
        assert_eq!(timer.context(), "ctx");
        assert!(Timer::from_parts(TimerId::parse("t")?, String::new(), i64::MAX).is_none());
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_deadline_never_earlier(secs in 0i64..4_000_000_000, nanos in 0u32..1_000_000_000) {
            let requested = at(secs, nanos).map_err(TestCaseError::fail)?;
            let timer = Timer::new("p", "", requested)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert!(timer.deadline() >= requested);
            prop_assert!(timer.deadline().signed_duration_since(requested) < TimeDelta::seconds(1));
            prop_assert_eq!(timer.deadline().timestamp_subsec_nanos(), 0);
        }

        #[test]
        fn prop_context_ttl_covers_deadline(offset in -10_000i64..10_000, margin in 0u64..3_600) {
            let now = at(2_000_000, 0).map_err(TestCaseError::fail)?;
            let deadline = now
                .checked_add_signed(TimeDelta::seconds(offset))
                .ok_or_else(|| TestCaseError::fail("deadline out of range"))?;
            let timer = Timer::new("p", "", deadline)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let ttl = timer.context_ttl(now, Duration::from_secs(margin));
            let remaining = u64::try_from(offset.max(0)).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert!(ttl >= Duration::from_secs(margin));
            prop_assert_eq!(ttl, Duration::from_secs(remaining.saturating_add(margin)));
        }
    }
}
