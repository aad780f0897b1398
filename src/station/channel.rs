use crate::component::Descriptor;
use crate::error::{ConfigurationError, DataOutOfFrame, InitializationError};
use crate::frame::{FillPolicy, RollingFrame};
use crate::station::status::DataStatus;

/// Position of a channel inside its station's channel list.
pub type ChannelId = usize;

/// How a composite channel folds its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    Sum,
    /// First input minus the rest.
    Difference,
    Mean,
}

impl CompositeOp {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "sum" | "add" => Some(Self::Sum),
            "difference" | "diff" | "sub" => Some(Self::Difference),
            "mean" | "avg" | "average" => Some(Self::Mean),
            _ => None,
        }
    }

    fn apply(&self, inputs: &[f64]) -> f64 {
        if inputs.is_empty() || inputs.iter().any(|v| !v.is_finite()) {
            return f64::NAN;
        }
        match self {
            CompositeOp::Sum => inputs.iter().sum(),
            CompositeOp::Difference => inputs[0] - inputs[1..].iter().sum::<f64>(),
            CompositeOp::Mean => inputs.iter().sum::<f64>() / inputs.len() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Numeric sensor value checked by the workflow.
    Value,
    /// Nonzero means an external alarm is active.
    Alarm,
    /// Nonzero means the station is being calibrated.
    Calibration,
    /// Derived from other channels of the same station.
    Composite(CompositeOp),
}

impl ChannelKind {
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, ChannelKind::Value | ChannelKind::Composite(_))
    }
}

/// One named signal of a station: raw and validated histories plus limits.
#[derive(Debug, Clone)]
pub struct DataChannel {
    name: String,
    tag: String,
    kind: ChannelKind,
    requires: Vec<String>,
    links: Vec<Option<ChannelId>>,
    valid_min: Option<f64>,
    valid_max: Option<f64>,
    set_point_low: Option<f64>,
    set_point_high: Option<f64>,
    fill: FillPolicy,
    raw: RollingFrame,
    valid: RollingFrame,
    status: DataStatus,
    last_index: Option<i64>,
}

impl DataChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        let name = name.into();
        Self {
            tag: name.clone(),
            name,
            kind,
            requires: Vec::new(),
            links: Vec::new(),
            valid_min: None,
            valid_max: None,
            set_point_low: None,
            set_point_high: None,
            fill: FillPolicy::Missing,
            raw: RollingFrame::new(1, FillPolicy::Missing),
            valid: RollingFrame::new(1, FillPolicy::Missing),
            status: DataStatus::MISSING,
            last_index: None,
        }
    }

    pub fn value(name: impl Into<String>) -> Self {
        Self::new(name, ChannelKind::Value)
    }

    pub fn composite<I, S>(name: impl Into<String>, op: CompositeOp, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ch = Self::new(name, ChannelKind::Composite(op));
        ch.requires = inputs.into_iter().map(Into::into).collect();
        ch.links = vec![None; ch.requires.len()];
        ch
    }

    /// Builds a channel from its descriptor. The class name selects the kind.
    pub fn from_descriptor(desc: &Descriptor) -> Result<Self, ConfigurationError> {
        let opts = &desc.options;
        let kind = match desc.class_name.as_str() {
            "value" => ChannelKind::Value,
            "alarm" => ChannelKind::Alarm,
            "calibration" => ChannelKind::Calibration,
            "composite" => {
                let op = opts.require_str(&desc.name, "op")?;
                ChannelKind::Composite(CompositeOp::parse(op).ok_or_else(|| {
                    ConfigurationError::InvalidOption {
                        component: desc.name.clone(),
                        option: "op".into(),
                        reason: format!("unknown composite operation `{op}`"),
                    }
                })?)
            }
            other => {
                return Err(ConfigurationError::InvalidOption {
                    component: desc.name.clone(),
                    option: "class".into(),
                    reason: format!("`{other}` is not a channel kind"),
                });
            }
        };

        let mut ch = Self::new(&desc.name, kind);
        ch.tag = desc.tag_or_name().to_string();
        ch.requires = desc.requires.clone();
        ch.requires.extend(opts.str_list("requires"));
        ch.links = vec![None; ch.requires.len()];
        ch.valid_min = opts.f64("valid_min");
        ch.valid_max = opts.f64("valid_max");
        ch.set_point_low = opts.f64("set_point_low");
        ch.set_point_high = opts.f64("set_point_high");

        if let Some(fill) = opts.str("fill") {
            ch.fill = match fill {
                "missing" => FillPolicy::Missing,
                "copy_last" => FillPolicy::CopyLast,
                other => {
                    return Err(ConfigurationError::InvalidOption {
                        component: desc.name.clone(),
                        option: "fill".into(),
                        reason: format!("unknown fill policy `{other}`"),
                    });
                }
            };
        }

        if let (ChannelKind::Composite(_), true) = (kind, ch.requires.is_empty()) {
            return Err(ConfigurationError::MissingOption {
                component: desc.name.clone(),
                option: "requires".into(),
            });
        }
        Ok(ch)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_valid_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.valid_min = min;
        self.valid_max = max;
        self
    }

    pub fn with_set_points(mut self, low: Option<f64>, high: Option<f64>) -> Self {
        self.set_point_low = low;
        self.set_point_high = high;
        self
    }

    pub fn with_fill(mut self, fill: FillPolicy) -> Self {
        self.fill = fill;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    #[inline]
    pub fn status(&self) -> DataStatus {
        self.status
    }

    #[inline]
    pub fn last_index(&self) -> Option<i64> {
        self.last_index
    }

    /// Resizes both histories. Drops anything recorded so far.
    pub fn set_window(&mut self, capacity: usize) {
        self.raw = RollingFrame::new(capacity, self.fill);
        self.valid = RollingFrame::new(capacity, self.fill);
        self.last_index = None;
    }

    #[inline]
    pub fn window_capacity(&self) -> usize {
        self.valid.capacity()
    }

    /// Resolves a required input by name. Unknown names are ignored.
    pub fn link_channel(&mut self, name: &str, id: ChannelId) {
        if let Some(pos) = self.requires.iter().position(|r| r == name) {
            self.links[pos] = Some(id);
        }
    }

    pub fn links(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.links.iter().flatten().copied()
    }

    pub fn initialize(&self) -> Result<(), InitializationError> {
        match self.requires.iter().zip(&self.links).find(|(_, l)| l.is_none()) {
            Some((required, _)) => Err(InitializationError::UnlinkedChannel {
                channel: self.name.clone(),
                required: required.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Stores a sample at `index`. `None` and non-finite values are missing.
    pub fn record(&mut self, index: i64, value: Option<f64>) -> Result<(), DataOutOfFrame> {
        let raw = value.filter(|v| v.is_finite()).unwrap_or(f64::NAN);
        self.raw.set(index, raw)?;

        let mut status = DataStatus::NORMAL;
        let mut valid = raw;
        if raw.is_nan() {
            status |= DataStatus::MISSING;
        } else if self.valid_min.is_some_and(|min| raw < min)
            || self.valid_max.is_some_and(|max| raw > max)
        {
            status |= DataStatus::OUT_OF_RANGE;
            valid = f64::NAN;
        }
        self.valid.set(index, valid)?;

        if valid.is_finite() {
            if self.limit_violation_of(valid) != 0 {
                status |= DataStatus::LIMIT_VIOLATION;
            }
            match self.kind {
                ChannelKind::Alarm if valid != 0.0 => status |= DataStatus::ALARM,
                ChannelKind::Calibration if valid != 0.0 => status |= DataStatus::CALIBRATING,
                _ => {}
            }
        }

        if self.last_index.is_none_or(|last| index >= last) {
            self.last_index = Some(index);
            self.status = status;
        }
        Ok(())
    }

    /// Moves the histories up to `index` when nothing arrived for it.
    pub fn sync(&mut self, index: i64) {
        if self.last_index.is_some_and(|last| last >= index) {
            return;
        }
        self.raw.advance_to(index);
        self.valid.advance_to(index);
        self.last_index = Some(index);

        self.status = match self.valid.get(index) {
            Ok(v) if v.is_finite() => {
                // copied forward
                let mut status = DataStatus::NORMAL;
                if self.limit_violation_of(v) != 0 {
                    status |= DataStatus::LIMIT_VIOLATION;
                }
                status
            }
            _ => DataStatus::MISSING,
        };
    }

    /// Recomputes a composite value from its linked inputs' values at `index`.
    pub fn derive(&mut self, index: i64, inputs: &[f64]) -> Result<(), DataOutOfFrame> {
        let ChannelKind::Composite(op) = self.kind else {
            return Ok(());
        };
        let value = op.apply(inputs);
        self.record(index, value.is_finite().then_some(value))
    }

    /// Validated value; NaN when missing or rejected.
    #[inline]
    pub fn value_at(&self, index: i64) -> Result<f64, DataOutOfFrame> {
        self.valid.get(index)
    }

    #[inline]
    pub fn raw_at(&self, index: i64) -> Result<f64, DataOutOfFrame> {
        self.raw.get(index)
    }

    /// Validated values for `[end - len + 1, end]`, oldest first.
    pub fn history(&self, end: i64, len: usize) -> Result<Vec<f64>, DataOutOfFrame> {
        self.valid.window(end, len)
    }

    /// -1 below the low set point, 1 above the high one, 0 otherwise.
    pub fn limit_violation(&self, index: i64) -> i8 {
        match self.valid.get(index) {
            Ok(v) if v.is_finite() => self.limit_violation_of(v),
            _ => 0,
        }
    }

    fn limit_violation_of(&self, v: f64) -> i8 {
        if self.set_point_low.is_some_and(|low| v < low) {
            -1
        } else if self.set_point_high.is_some_and(|high| v > high) {
            1
        } else {
            0
        }
    }

    /// Alarm and calibration channels: the signal is on at `index`.
    pub fn is_active(&self, index: i64) -> bool {
        matches!(self.kind, ChannelKind::Alarm | ChannelKind::Calibration)
            && matches!(self.valid.get(index), Ok(v) if v.is_finite() && v != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_values_are_invalidated() {
        let mut ch = DataChannel::value("PH").with_valid_range(Some(0.0), Some(14.0));
        ch.set_window(8);
        ch.record(0, Some(7.0)).unwrap();
        assert_eq!(ch.status(), DataStatus::NORMAL);
        ch.record(1, Some(20.0)).unwrap();
        assert!(ch.status().contains(DataStatus::OUT_OF_RANGE));
        assert_eq!(ch.raw_at(1).unwrap(), 20.0);
        assert!(ch.value_at(1).unwrap().is_nan());
    }

    #[test]
    fn set_points_flag_violations() {
        let mut ch = DataChannel::value("CL").with_set_points(Some(0.2), Some(4.0));
        ch.set_window(4);
        ch.record(0, Some(0.1)).unwrap();
        assert_eq!(ch.limit_violation(0), -1);
        ch.record(1, Some(5.0)).unwrap();
        assert_eq!(ch.limit_violation(1), 1);
        assert!(ch.status().contains(DataStatus::LIMIT_VIOLATION));
        ch.record(2, Some(1.0)).unwrap();
        assert_eq!(ch.limit_violation(2), 0);
    }

    #[test]
    fn sync_marks_missing_unless_copied_forward() {
        let mut ch = DataChannel::value("T");
        ch.set_window(4);
        ch.record(0, Some(1.5)).unwrap();
        ch.sync(1);
        assert!(ch.status().contains(DataStatus::MISSING));

        let mut held = DataChannel::value("T").with_fill(FillPolicy::CopyLast);
        held.set_window(4);
        held.record(0, Some(1.5)).unwrap();
        held.sync(2);
        assert_eq!(held.value_at(2).unwrap(), 1.5);
        assert_eq!(held.status(), DataStatus::NORMAL);
    }

    #[test]
    fn composite_requires_links() {
        let desc = Descriptor::new("DIFF", "composite")
            .with_option("op", "difference")
            .requiring(["A", "B"]);
        let mut ch = DataChannel::from_descriptor(&desc).unwrap();
        ch.set_window(4);
        assert!(matches!(
            ch.initialize(),
            Err(InitializationError::UnlinkedChannel { ref required, .. }) if required == "A"
        ));
        ch.link_channel("A", 0);
        ch.link_channel("B", 1);
        ch.initialize().unwrap();
        assert_eq!(ch.links().collect::<Vec<_>>(), vec![0, 1]);

        ch.derive(3, &[5.0, 2.0]).unwrap();
        assert_eq!(ch.value_at(3).unwrap(), 3.0);
        ch.derive(4, &[5.0, f64::NAN]).unwrap();
        assert!(ch.status().contains(DataStatus::MISSING));
    }

    #[test]
    fn descriptor_errors_name_the_option() {
        let bad = Descriptor::new("X", "composite").with_option("op", "median");
        assert!(matches!(
            DataChannel::from_descriptor(&bad),
            Err(ConfigurationError::InvalidOption { ref option, .. }) if option == "op"
        ));
        let unlinked = Descriptor::new("X", "composite").with_option("op", "sum");
        assert!(matches!(
            DataChannel::from_descriptor(&unlinked),
            Err(ConfigurationError::MissingOption { .. })
        ));
    }

    #[test]
    fn alarm_channels_report_activity() {
        let mut alarm = DataChannel::new("DOOR", ChannelKind::Alarm);
        alarm.set_window(2);
        alarm.record(0, Some(1.0)).unwrap();
        assert!(alarm.is_active(0));
        assert!(alarm.status().contains(DataStatus::ALARM));
        alarm.record(1, Some(0.0)).unwrap();
        assert!(!alarm.is_active(1));
    }
}
