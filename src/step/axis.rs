use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::cmp::Ordering;
use std::fmt::{self, Debug};

/// Relative tolerance used to snap real-valued quotients onto integers before
/// taking the ceiling, so `origin + i * stride` maps back to `i`.
const REAL_SNAP_EPSILON: f64 = 1e-9;

/// 2^63; floats at or beyond it do not convert to `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Why a value has no index on its axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    ZeroStride,
    /// The index does not fit in an `i64`.
    Overflow,
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::ZeroStride => write!(f, "axis stride is zero"),
            IndexError::Overflow => write!(f, "step index is out of range"),
        }
    }
}

/// Arithmetic of one step axis: how a value maps to a discrete index and back.
pub trait StepValue: Clone + Debug + Send + Sync + 'static {
    type Stride: Clone + Debug + Send + Sync + 'static;

    /// `ceil((value - origin) / stride)`.
    fn index_of(value: &Self, origin: &Self, stride: &Self::Stride) -> Result<i64, IndexError>;

    /// `origin + index * stride`, saturating at the ends of the value range.
    fn value_at(origin: &Self, stride: &Self::Stride, index: i64) -> Self;

    fn compare(a: &Self, b: &Self) -> Ordering;

    fn parse(text: &str, format: &str) -> Result<Self, String>;

    fn render(&self, format: &str) -> String;
}

#[inline]
fn ceil_div(num: i64, den: i64) -> Result<i64, IndexError> {
    if den == 0 {
        return Err(IndexError::ZeroStride);
    }
    let q = num.checked_div(den).ok_or(IndexError::Overflow)?;
    let r = num.checked_rem(den).ok_or(IndexError::Overflow)?;
    if r != 0 && ((r > 0) == (den > 0)) {
        q.checked_add(1).ok_or(IndexError::Overflow)
    } else {
        Ok(q)
    }
}

impl StepValue for i64 {
    type Stride = i64;

    fn index_of(value: &i64, origin: &i64, stride: &i64) -> Result<i64, IndexError> {
        if *stride == 0 {
            return Err(IndexError::ZeroStride);
        }
        let offset = value.checked_sub(*origin).ok_or(IndexError::Overflow)?;
        ceil_div(offset, *stride)
    }

    fn value_at(origin: &i64, stride: &i64, index: i64) -> i64 {
        origin.saturating_add(index.saturating_mul(*stride))
    }

    fn compare(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn parse(text: &str, _format: &str) -> Result<i64, String> {
        let text = text.trim();
        if let Ok(v) = text.parse::<i64>() {
            return Ok(v);
        }
        let v = text
            .parse::<f64>()
            .map_err(|e| format!("invalid integer step `{text}`: {e}"))?
            .ceil();
        if v.is_finite() && v.abs() < I64_LIMIT {
            Ok(v as i64)
        } else {
            Err(format!("integer step `{text}` is out of range"))
        }
    }

    fn render(&self, _format: &str) -> String {
        self.to_string()
    }
}

impl StepValue for f64 {
    type Stride = f64;

    fn index_of(value: &f64, origin: &f64, stride: &f64) -> Result<i64, IndexError> {
        if *stride == 0.0 || !stride.is_finite() {
            return Err(IndexError::ZeroStride);
        }
        let q = (value - origin) / stride;
        let nearest = q.round();
        let index = if (q - nearest).abs() <= REAL_SNAP_EPSILON * nearest.abs().max(1.0) {
            nearest
        } else {
            q.ceil()
        };
        if index.is_finite() && index.abs() < I64_LIMIT {
            Ok(index as i64)
        } else {
            Err(IndexError::Overflow)
        }
    }

    fn value_at(origin: &f64, stride: &f64, index: i64) -> f64 {
        origin + index as f64 * stride
    }

    fn compare(a: &f64, b: &f64) -> Ordering {
        a.total_cmp(b)
    }

    fn parse(text: &str, _format: &str) -> Result<f64, String> {
        text.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid real step `{text}`: {e}"))
    }

    /// `format` holds the number of decimals; anything else renders with `Display`.
    fn render(&self, format: &str) -> String {
        match format.trim().parse::<usize>() {
            Ok(decimals) => format!("{:.*}", decimals, self),
            Err(_) => self.to_string(),
        }
    }
}

impl StepValue for DateTime<Utc> {
    type Stride = TimeDelta;

    fn index_of(value: &Self, origin: &Self, stride: &TimeDelta) -> Result<i64, IndexError> {
        let elapsed_ms = value.signed_duration_since(*origin).num_milliseconds();
        ceil_div(elapsed_ms, stride.num_milliseconds())
    }

    fn value_at(origin: &Self, stride: &TimeDelta, index: i64) -> Self {
        let offset_ms = stride.num_milliseconds().saturating_mul(index).max(-i64::MAX);
        let offset = TimeDelta::milliseconds(offset_ms);
        origin
            .checked_add_signed(offset)
            .unwrap_or(if index < 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
    }

    fn compare(a: &Self, b: &Self) -> Ordering {
        a.cmp(b)
    }

    /// Accepts RFC 3339 or the axis' own chrono pattern (read as UTC).
    fn parse(text: &str, format: &str) -> Result<Self, String> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, format)
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid date/time step `{text}` for format `{format}`: {e}"))
    }

    fn render(&self, format: &str) -> String {
        if format.is_empty() {
            self.to_rfc3339()
        } else {
            self.format(format).to_string()
        }
    }
}

/// One discrete axis: origin, stride and a current position kept in sync as
/// both a value and an index.
#[derive(Clone, Debug)]
pub struct StepAxis<T: StepValue> {
    origin: T,
    stride: T::Stride,
    value: T,
    index: i64,
    format: String,
}

impl<T: StepValue> StepAxis<T> {
    /// Axis positioned at its origin (index 0).
    pub fn new(origin: T, stride: T::Stride, format: impl Into<String>) -> Self {
        Self {
            value: origin.clone(),
            origin,
            stride,
            index: 0,
            format: format.into(),
        }
    }

    #[inline]
    pub fn origin(&self) -> &T {
        &self.origin
    }

    #[inline]
    pub fn stride(&self) -> &T::Stride {
        &self.stride
    }

    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn index(&self) -> i64 {
        self.index
    }

    #[inline]
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Moves to `value` and recomputes the index. With a zero stride the index
    /// keeps its previous value. A value whose index overflows leaves the axis
    /// unchanged.
    pub fn set_value(&mut self, value: T) -> Result<(), IndexError> {
        match T::index_of(&value, &self.origin, &self.stride) {
            Ok(index) => self.index = index,
            Err(IndexError::ZeroStride) => {}
            Err(e) => return Err(e),
        }
        self.value = value;
        Ok(())
    }

    pub fn set_index(&mut self, index: i64) {
        self.index = index;
        self.value = T::value_at(&self.origin, &self.stride, index);
    }

    pub fn parse_value(&self, text: &str) -> Result<T, String> {
        T::parse(text, &self.format)
    }

    pub fn render(&self) -> String {
        self.value.render(&self.format)
    }
}
