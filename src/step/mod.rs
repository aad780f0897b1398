//! Discrete step axes. Every message is binned and ordered by a [`Step`].

mod axis;

pub use axis::{IndexError, StepAxis, StepValue};

use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Integer,
    Real,
    DateTime,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Integer => write!(f, "integer"),
            StepKind::Real => write!(f, "real"),
            StepKind::DateTime => write!(f, "date_time"),
        }
    }
}

/// A position on an integer, real or date/time axis.
///
/// Steps of the same kind compare by value. Steps of different kinds fall
/// back to comparing indices and log a warning, which is almost always a
/// wiring mistake between components.
#[derive(Clone, Debug)]
pub enum Step {
    Integer(StepAxis<i64>),
    Real(StepAxis<f64>),
    DateTime(StepAxis<DateTime<Utc>>),
}

impl Step {
    pub fn integer(origin: i64, stride: i64) -> Self {
        Step::Integer(StepAxis::new(origin, stride, ""))
    }

    /// `decimals` controls how many fraction digits the value renders with.
    pub fn real(origin: f64, stride: f64, decimals: Option<usize>) -> Self {
        let format = decimals.map(|d| d.to_string()).unwrap_or_default();
        Step::Real(StepAxis::new(origin, stride, format))
    }

    /// `format` is a chrono pattern; empty means RFC 3339.
    pub fn date_time(origin: DateTime<Utc>, stride: TimeDelta, format: impl Into<String>) -> Self {
        Step::DateTime(StepAxis::new(origin, stride, format))
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Integer(_) => StepKind::Integer,
            Step::Real(_) => StepKind::Real,
            Step::DateTime(_) => StepKind::DateTime,
        }
    }

    #[inline]
    pub fn index(&self) -> i64 {
        match self {
            Step::Integer(a) => a.index(),
            Step::Real(a) => a.index(),
            Step::DateTime(a) => a.index(),
        }
    }

    pub fn set_index(&mut self, index: i64) {
        match self {
            Step::Integer(a) => a.set_index(index),
            Step::Real(a) => a.set_index(index),
            Step::DateTime(a) => a.set_index(index),
        }
    }

    /// Clone of this axis moved to `index`.
    pub fn at_index(&self, index: i64) -> Step {
        let mut step = self.clone();
        step.set_index(index);
        step
    }

    /// Parses `text` with this axis' type and format and moves to it.
    pub fn set_value_str(&mut self, text: &str) -> Result<(), String> {
        match self {
            Step::Integer(a) => {
                let v = a.parse_value(text)?;
                a.set_value(v).map_err(|e| format!("`{}`: {e}", text.trim()))?;
            }
            Step::Real(a) => {
                let v = a.parse_value(text)?;
                a.set_value(v).map_err(|e| format!("`{}`: {e}", text.trim()))?;
            }
            Step::DateTime(a) => {
                let v = a.parse_value(text)?;
                a.set_value(v).map_err(|e| format!("`{}`: {e}", text.trim()))?;
            }
        }
        Ok(())
    }

    /// Clone of this axis moved to the parsed `text`.
    pub fn parse_on_axis(&self, text: &str) -> Result<Step, String> {
        let mut step = self.clone();
        step.set_value_str(text)?;
        Ok(step)
    }

    /// Wall-clock instant at which this step ends, for date/time axes.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Step::DateTime(a) => a.value().checked_add_signed(*a.stride()),
            _ => None,
        }
    }

    fn compare(&self, other: &Step) -> Ordering {
        match (self, other) {
            (Step::Integer(a), Step::Integer(b)) => i64::compare(a.value(), b.value()),
            (Step::Real(a), Step::Real(b)) => f64::compare(a.value(), b.value()),
            (Step::DateTime(a), Step::DateTime(b)) => {
                <DateTime<Utc>>::compare(a.value(), b.value())
            }
            _ => {
                tracing::warn!(
                    "comparing {} step with {} step, falling back to index order",
                    self.kind(),
                    other.kind()
                );
                self.index().cmp(&other.index())
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Integer(a) => write!(f, "{}", a.render()),
            Step::Real(a) => write!(f, "{}", a.render()),
            Step::DateTime(a) => write!(f, "{}", a.render()),
        }
    }
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Step {}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn integer_index_uses_ceiling_division() {
        let mut axis = StepAxis::new(10i64, 5, "");
        axis.set_value(21).unwrap();
        assert_eq!(axis.index(), 3);
        axis.set_value(20).unwrap();
        assert_eq!(axis.index(), 2);
        axis.set_value(6).unwrap();
        assert_eq!(axis.index(), 0);
        axis.set_value(4).unwrap();
        assert_eq!(axis.index(), -1);
    }

    #[test]
    fn zero_stride_keeps_stale_index() {
        let mut axis = StepAxis::new(0i64, 1, "");
        axis.set_value(7).unwrap();
        assert_eq!(axis.index(), 7);

        let mut frozen = StepAxis::new(0i64, 0, "");
        frozen.set_index(4);
        frozen.set_value(99).unwrap();
        assert_eq!(frozen.index(), 4);
        assert_eq!(*frozen.value(), 99);
    }

    #[test]
    fn date_time_axis_maps_minutes() {
        let origin = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut step = Step::date_time(origin, TimeDelta::minutes(5), "%Y-%m-%d %H:%M:%S");
        step.set_value_str("2024-01-01 00:12:00").unwrap();
        assert_eq!(step.index(), 3);
        step.set_index(2);
        assert_eq!(step.to_string(), "2024-01-01 00:10:00");
        assert_eq!(
            step.end_time(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap())
        );
    }

    #[test]
    fn real_axis_renders_decimals() {
        let step = Step::real(0.0, 0.25, Some(2)).at_index(3);
        assert_eq!(step.to_string(), "0.75");
    }

    #[test]
    fn real_axis_snaps_near_integer_quotients() {
        // 3 * 0.1 lands just above 0.3, a bare ceiling would give index 4
        let on_grid = 3.0 * 0.1;
        assert!(on_grid / 0.1 > 3.0);
        assert_eq!(f64::index_of(&on_grid, &0.0, &0.1), Ok(3));

        let mut axis = StepAxis::new(0.0f64, 0.1, "");
        axis.set_index(3);
        let stored = *axis.value();
        axis.set_value(stored).unwrap();
        assert_eq!(axis.index(), 3);

        // off-grid values still take the ceiling
        assert_eq!(f64::index_of(&(0.3 + 1e-6), &0.0, &0.1), Ok(4));
        assert_eq!(f64::index_of(&0.25, &0.0, &0.1), Ok(3));
        // the tolerance scales with the index
        assert_eq!(f64::index_of(&(1.0e6 + 1.0e-6), &0.0, &1.0), Ok(1_000_000));
        assert_eq!(f64::index_of(&(1.0e6 + 1.0e-2), &0.0, &1.0), Ok(1_000_001));
    }

    #[test]
    fn same_kind_orders_by_value() {
        let base = Step::integer(0, 10);
        let a = base.at_index(1);
        let b = base.at_index(2);
        assert!(a < b);
        assert_eq!(a, base.parse_on_axis("10").unwrap());
    }

    #[test]
    fn mixed_kinds_fall_back_to_index() {
        let int_step = Step::integer(1000, 1).at_index(3);
        let real_step = Step::real(0.0, 0.5, None).at_index(5);
        assert!(int_step < real_step);
        assert_eq!(int_step, Step::real(-7.0, 2.0, None).at_index(3));
    }

    #[test]
    fn out_of_range_values_are_rejected_not_wrapped() {
        let base = Step::integer(-5, 1);
        assert!(base.parse_on_axis("9223372036854775807").is_err());
        assert!(base.parse_on_axis("1e30").is_err());
        assert_eq!(base.parse_on_axis("9223372036854775802").unwrap().index(), i64::MAX);

        let mut axis = StepAxis::new(0i64, -1, "");
        axis.set_value(3).unwrap();
        assert_eq!(axis.set_value(i64::MIN), Err(IndexError::Overflow));
        assert_eq!(axis.index(), -3);
        assert_eq!(*axis.value(), 3);

        let real = Step::real(0.0, 1e-300, None);
        assert!(real.parse_on_axis("1e10").is_err());

        // far indices saturate instead of overflowing
        let mut far = StepAxis::new(1i64, 2, "");
        far.set_index(i64::MAX);
        assert_eq!(*far.value(), i64::MAX);
    }

    proptest! {
        #[test]
        fn integer_index_round_trip(origin in -10_000i64..10_000, stride in prop_oneof![1i64..500, -500i64..-1], value in -100_000i64..100_000) {
            let mut axis = StepAxis::new(origin, stride, "");
            axis.set_value(value).unwrap();
            let i1 = axis.index();
            axis.set_index(i1);
            let v2 = *axis.value();
            prop_assert_eq!(i64::index_of(&v2, &origin, &stride), Ok(i1));
        }

        #[test]
        fn real_index_round_trip(origin in -1.0e4f64..1.0e4, stride in 0.01f64..100.0, value in -1.0e5f64..1.0e5) {
            let mut axis = StepAxis::new(origin, stride, "");
            axis.set_value(value).unwrap();
            let i1 = axis.index();
            axis.set_index(i1);
            let v2 = *axis.value();
            prop_assert_eq!(f64::index_of(&v2, &origin, &stride), Ok(i1));
        }

        #[test]
        fn date_time_index_round_trip(stride_s in 1i64..7200, offset_s in -1_000_000i64..1_000_000) {
            let origin = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
            let stride = TimeDelta::seconds(stride_s);
            let mut axis = StepAxis::new(origin, stride, "");
            axis.set_value(origin + TimeDelta::seconds(offset_s)).unwrap();
            let i1 = axis.index();
            axis.set_index(i1);
            prop_assert_eq!(<DateTime<Utc>>::index_of(axis.value(), &origin, &stride), Ok(i1));
        }
    }
}
