//! Threshold triggers shared by batch flushing and index rollover
//!
//! Both the write batch and the active index are closed when one of three
//! limits is reached: byte size, item count or age. When several limits are
//! exceeded at the same evaluation instant, the configured
//! [`TriggerPrecedence`] decides which one is reported. The default order is
//! size, then count, then age.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The three limit dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Size,
    Count,
    Age,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Size => "size",
            TriggerKind::Count => "count",
            TriggerKind::Age => "age",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "size" => Ok(TriggerKind::Size),
            "count" | "docs" => Ok(TriggerKind::Count),
            "age" => Ok(TriggerKind::Age),
            other => Err(Error::Config(format!(
                "unknown trigger '{}'; expected one of size, count, age",
                other
            ))),
        }
    }
}

/// Evaluation order for simultaneously satisfied limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPrecedence([TriggerKind; 3]);

impl TriggerPrecedence {
    /// `order` must name each kind exactly once.
    pub fn new(order: [TriggerKind; 3]) -> Result<Self> {
        let distinct = order[0] != order[1] && order[1] != order[2] && order[0] != order[2];
        if !distinct {
            return Err(Error::Config(format!(
                "trigger precedence must list size, count and age once each, got {:?}",
                order
            )));
        }
        Ok(Self(order))
    }

    pub fn order(&self) -> &[TriggerKind; 3] {
        &self.0
    }
}

impl Default for TriggerPrecedence {
    fn default() -> Self {
        Self([TriggerKind::Size, TriggerKind::Count, TriggerKind::Age])
    }
}

impl FromStr for TriggerPrecedence {
    type Err = Error;

    /// Parses a comma separated list such as `count,size,age`.
    fn from_str(value: &str) -> Result<Self> {
        let kinds = value
            .split(',')
            .map(TriggerKind::from_str)
            .collect::<Result<Vec<_>>>()?;
        let order: [TriggerKind; 3] = kinds.try_into().map_err(|kinds: Vec<TriggerKind>| {
            Error::Config(format!(
                "trigger precedence needs exactly 3 entries, got {}",
                kinds.len()
            ))
        })?;
        Self::new(order)
    }
}

/// A limit that was reached, with the threshold and the measured value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    AgeExceeded { threshold: Duration, measured: Duration },
    CountExceeded { threshold: u64, measured: u64 },
    SizeExceeded { threshold: u64, measured: u64 },
}

/// Trigger that closed a write batch
pub type FlushTrigger = Trigger;
/// Trigger that caused an index rollover
pub type RolloverTrigger = Trigger;

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::AgeExceeded { .. } => TriggerKind::Age,
            Trigger::CountExceeded { .. } => TriggerKind::Count,
            Trigger::SizeExceeded { .. } => TriggerKind::Size,
        }
    }

    /// Metric/log label for this trigger
    pub fn reason(&self) -> &'static str {
        match self {
            Trigger::AgeExceeded { .. } => "age_exceeded",
            Trigger::CountExceeded { .. } => "count_exceeded",
            Trigger::SizeExceeded { .. } => "size_exceeded",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::AgeExceeded { threshold, measured } => write!(
                f,
                "age {:?} >= max age {:?}",
                measured, threshold
            ),
            Trigger::CountExceeded { threshold, measured } => {
                write!(f, "count {} >= max count {}", measured, threshold)
            }
            Trigger::SizeExceeded { threshold, measured } => {
                write!(f, "size {}B >= max size {}B", measured, threshold)
            }
        }
    }
}

/// Current size, count and age of the thing being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Measurement {
    pub size_bytes: u64,
    pub count: u64,
    pub age: Duration,
}

/// Limits; `None` disables a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Thresholds {
    pub max_size_bytes: Option<u64>,
    pub max_count: Option<u64>,
    pub max_age: Option<Duration>,
}

impl Thresholds {
    /// Return the first exceeded limit in precedence order.
    ///
    /// Nothing is reported for an empty measurement (count 0).
    pub fn evaluate(
        &self,
        measured: &Measurement,
        precedence: &TriggerPrecedence,
    ) -> Option<Trigger> {
        self.evaluate_only(measured, precedence, precedence.order())
    }

    /// Like [`evaluate`](Self::evaluate), restricted to `kinds`.
    pub fn evaluate_only(
        &self,
        measured: &Measurement,
        precedence: &TriggerPrecedence,
        kinds: &[TriggerKind],
    ) -> Option<Trigger> {
        if measured.count == 0 {
            return None;
        }
        self.first_exceeded(measured, precedence, kinds)
    }

    /// Like [`evaluate`](Self::evaluate), but an empty measurement may
    /// still breach a limit.
    pub fn evaluate_including_empty(
        &self,
        measured: &Measurement,
        precedence: &TriggerPrecedence,
    ) -> Option<Trigger> {
        self.first_exceeded(measured, precedence, precedence.order())
    }

    fn first_exceeded(
        &self,
        measured: &Measurement,
        precedence: &TriggerPrecedence,
        kinds: &[TriggerKind],
    ) -> Option<Trigger> {
        precedence
            .order()
            .iter()
            .filter(|kind| kinds.contains(kind))
            .find_map(|kind| self.check(*kind, measured))
    }

    fn check(&self, kind: TriggerKind, measured: &Measurement) -> Option<Trigger> {
        match kind {
            TriggerKind::Size => self
                .max_size_bytes
                .filter(|max| measured.size_bytes >= *max)
                .map(|threshold| Trigger::SizeExceeded {
                    threshold,
                    measured: measured.size_bytes,
                }),
            TriggerKind::Count => self
                .max_count
                .filter(|max| measured.count >= *max)
                .map(|threshold| Trigger::CountExceeded {
                    threshold,
                    measured: measured.count,
                }),
            TriggerKind::Age => self
                .max_age
                .filter(|max| measured.age >= *max)
                .map(|threshold| Trigger::AgeExceeded {
                    threshold,
                    measured: measured.age,
                }),
        }
    }

    /// Reject zero limits, which would fire on every evaluation.
    pub fn validate(&self, what: &str) -> Result<()> {
        if self.max_size_bytes == Some(0) || self.max_count == Some(0) {
            return Err(Error::Config(format!("{} limits must be positive", what)));
        }
        if self.max_age == Some(Duration::ZERO) {
            return Err(Error::Config(format!("{} max age must be positive", what)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Thresholds {
        Thresholds {
            max_size_bytes: Some(100),
            max_count: Some(3),
            max_age: Some(Duration::from_secs(10)),
        }
    }

    #[test]
    fn test_nothing_below_limits() {
        let m = Measurement {
            size_bytes: 99,
            count: 2,
            age: Duration::from_secs(9),
        };
        assert_eq!(limits().evaluate(&m, &TriggerPrecedence::default()), None);
    }

    #[test]
    fn test_default_precedence_prefers_size_then_count_then_age() {
        let all = Measurement {
            size_bytes: 200,
            count: 5,
            age: Duration::from_secs(60),
        };
        let p = TriggerPrecedence::default();
        assert_eq!(
            limits().evaluate(&all, &p).map(|t| t.kind()),
            Some(TriggerKind::Size)
        );

        let count_and_age = Measurement { size_bytes: 1, ..all };
        assert_eq!(
            limits().evaluate(&count_and_age, &p).map(|t| t.kind()),
            Some(TriggerKind::Count)
        );
    }

    #[test]
    fn test_custom_precedence() {
        let all = Measurement {
            size_bytes: 200,
            count: 5,
            age: Duration::from_secs(60),
        };
        let p: TriggerPrecedence = "age,count,size".parse().unwrap();
        let trigger = limits().evaluate(&all, &p).unwrap();
        assert_eq!(
            trigger,
            Trigger::AgeExceeded {
                threshold: Duration::from_secs(10),
                measured: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_empty_never_triggers() {
        let empty = Measurement {
            size_bytes: 0,
            count: 0,
            age: Duration::from_secs(3600),
        };
        assert_eq!(limits().evaluate(&empty, &TriggerPrecedence::default()), None);
        assert!(matches!(
            limits().evaluate_including_empty(&empty, &TriggerPrecedence::default()),
            Some(Trigger::AgeExceeded { .. })
        ));
    }

    #[test]
    fn test_disabled_dimension() {
        let t = Thresholds {
            max_size_bytes: None,
            ..limits()
        };
        let m = Measurement {
            size_bytes: u64::MAX,
            count: 1,
            age: Duration::ZERO,
        };
        assert_eq!(t.evaluate(&m, &TriggerPrecedence::default()), None);
    }

    #[test]
    fn test_evaluate_only_restricts_kinds() {
        let m = Measurement {
            size_bytes: 1,
            count: 1,
            age: Duration::from_secs(30),
        };
        let p = TriggerPrecedence::default();
        assert_eq!(
            limits().evaluate_only(&m, &p, &[TriggerKind::Size, TriggerKind::Count]),
            None
        );
        assert!(limits().evaluate_only(&m, &p, &[TriggerKind::Age]).is_some());
    }

    #[test]
    fn test_precedence_rejects_duplicates() {
        assert!("size,size,age".parse::<TriggerPrecedence>().is_err());
        assert!("size,count".parse::<TriggerPrecedence>().is_err());
    }
}
