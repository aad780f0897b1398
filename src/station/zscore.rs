use crate::component::Descriptor;
use crate::error::ConfigurationError;
use crate::station::channel::{ChannelId, ChannelKind, DataChannel};
use crate::station::status::EventStatus;
use crate::station::workflow::{Workflow, WorkflowEvaluation};
use std::collections::VecDeque;

/// Z-score outlier detection over a trailing history, with a binomial event
/// discriminator (BED) turning outlier counts into an event probability.
#[derive(Debug, Clone)]
pub struct ZScoreWorkflow {
    name: String,
    history_window: usize,
    outlier_threshold: f64,
    bed_window: usize,
    outlier_probability: f64,
    event_threshold: f64,
    event_timeout: usize,
    pre_event_history: usize,
    min_std: f64,

    channels: Vec<ChannelId>,
    outliers: VecDeque<bool>,
    event_steps: usize,
    seen: usize,
    last_probability: f64,
}

impl ZScoreWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history_window: 30,
            outlier_threshold: 3.0,
            bed_window: 6,
            outlier_probability: 0.5,
            event_threshold: 0.975,
            event_timeout: 60,
            pre_event_history: 30,
            min_std: 1e-6,
            channels: Vec::new(),
            outliers: VecDeque::new(),
            event_steps: 0,
            seen: 0,
            last_probability: 0.0,
        }
    }

    pub fn from_descriptor(desc: &Descriptor) -> Result<Self, ConfigurationError> {
        let opts = &desc.options;
        let invalid = |option: &str, reason: &str| ConfigurationError::InvalidOption {
            component: desc.name.clone(),
            option: option.to_string(),
            reason: reason.to_string(),
        };

        let mut wf = Self::new(&desc.name);
        if let Some(v) = opts.usize("history_window") {
            wf.history_window = v;
        }
        if let Some(v) = opts.f64("outlier_threshold") {
            wf.outlier_threshold = v;
        }
        if let Some(v) = opts.usize("bed_window") {
            wf.bed_window = v;
        }
        if let Some(v) = opts.f64("outlier_probability") {
            wf.outlier_probability = v;
        }
        if let Some(v) = opts.f64("event_threshold") {
            wf.event_threshold = v;
        }
        if let Some(v) = opts.usize("event_timeout") {
            wf.event_timeout = v;
        }
        wf.pre_event_history = opts.usize("pre_event_history").unwrap_or(wf.history_window);
        if let Some(v) = opts.f64("min_std") {
            wf.min_std = v;
        }

        if wf.history_window < 2 {
            return Err(invalid("history_window", "must be at least 2"));
        }
        if wf.bed_window == 0 {
            return Err(invalid("bed_window", "must be positive"));
        }
        if !(wf.outlier_probability > 0.0 && wf.outlier_probability < 1.0) {
            return Err(invalid("outlier_probability", "must be inside (0, 1)"));
        }
        if !(wf.outlier_threshold > 0.0) {
            return Err(invalid("outlier_threshold", "must be positive"));
        }
        Ok(wf)
    }

    pub fn with_history_window(mut self, steps: usize) -> Self {
        self.history_window = steps.max(2);
        self.pre_event_history = self.history_window;
        self
    }

    pub fn with_outlier_threshold(mut self, threshold: f64) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    pub fn with_bed(mut self, window: usize, outlier_probability: f64, event_threshold: f64) -> Self {
        self.bed_window = window.max(1);
        self.outlier_probability = outlier_probability;
        self.event_threshold = event_threshold;
        self
    }

    pub fn with_event_timeout(mut self, steps: usize) -> Self {
        self.event_timeout = steps;
        self
    }

    /// P(X < k) for X ~ Binomial(n, p): the chance of seeing fewer than `k`
    /// outliers in `n` steps by accident.
    pub fn bed_probability(k: usize, n: usize, p: f64) -> f64 {
        if k == 0 {
            return 0.0;
        }
        if k > n {
            return 1.0;
        }
        let ratio = p / (1.0 - p);
        let mut pmf = (1.0 - p).powi(n as i32);
        let mut cdf = 0.0;
        for i in 0..k {
            cdf += pmf;
            pmf *= (n - i) as f64 / (i + 1) as f64 * ratio;
        }
        cdf.clamp(0.0, 1.0)
    }

    fn residual(&self, channel: &DataChannel, index: i64, x: f64) -> anyhow::Result<f64> {
        let history: Vec<f64> = channel
            .history(index - 1, self.history_window)?
            .into_iter()
            .filter(|v| v.is_finite())
            .collect();
        if history.len() < 2 {
            return Ok(f64::NAN);
        }
        let n = history.len() as f64;
        let mean = history.iter().sum::<f64>() / n;
        let var = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Ok((x - mean) / var.sqrt().max(self.min_std))
    }
}

impl Workflow for ZScoreWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_channel(&mut self, id: ChannelId, _channel: &DataChannel) {
        self.channels.push(id);
    }

    fn evaluate_workflow(
        &mut self,
        index: i64,
        channels: &[DataChannel],
    ) -> anyhow::Result<WorkflowEvaluation> {
        let mut eval = WorkflowEvaluation::new(channels.len(), EventStatus::NORMAL);
        for (i, ch) in channels.iter().enumerate() {
            eval.raw[i] = ch.raw_at(index)?;
            eval.violations[i] = ch.limit_violation(index);
        }

        let mut flags = EventStatus::NORMAL;
        if channels
            .iter()
            .any(|c| c.kind() == ChannelKind::Alarm && c.is_active(index))
        {
            flags |= EventStatus::CHANNELS_ALARMING;
        }
        if channels
            .iter()
            .any(|c| c.kind() == ChannelKind::Calibration && c.is_active(index))
        {
            self.outliers.clear();
            self.event_steps = 0;
            self.last_probability = 0.0;
            eval.status = flags | EventStatus::STATION_CALIBRATING;
            return Ok(eval);
        }

        self.seen += 1;
        if self.seen <= self.history_window {
            eval.status = flags | EventStatus::UNINITIALIZED;
            return Ok(eval);
        }

        let mut any_value = false;
        let mut outlier = false;
        for &id in &self.channels {
            let Some(ch) = channels.get(id) else {
                anyhow::bail!("workflow `{}` has no channel #{id}", self.name);
            };
            if !ch.kind().is_numeric() {
                continue;
            }
            let x = ch.value_at(index)?;
            if !x.is_finite() {
                continue;
            }
            any_value = true;
            let z = self.residual(ch, index, x)?;
            eval.residuals[id] = z;
            let hit = z.abs() > self.outlier_threshold || eval.violations[id] != 0;
            eval.contributed[id] = hit;
            outlier |= hit;
        }

        if !any_value {
            eval.probability = self.last_probability;
            eval.status = flags | EventStatus::DATA_MISSING;
            return Ok(eval);
        }

        if self.outliers.len() == self.bed_window {
            self.outliers.pop_front();
        }
        self.outliers.push_back(outlier);
        let k = self.outliers.iter().filter(|o| **o).count();
        let probability = Self::bed_probability(k, self.bed_window, self.outlier_probability);
        eval.probability = probability;
        self.last_probability = probability;

        let mut status = if outlier {
            EventStatus::OUTLIER_DETECTED
        } else {
            EventStatus::NORMAL
        };
        if probability >= self.event_threshold {
            self.event_steps += 1;
            if self.event_timeout > 0 && self.event_steps > self.event_timeout {
                // accept the new level as baseline
                status |= EventStatus::EVENT_TIMEOUT;
                self.outliers.clear();
                self.event_steps = 0;
                self.last_probability = 0.0;
            } else {
                status |= EventStatus::POSSIBLE_EVENT;
            }
        } else {
            self.event_steps = 0;
        }
        eval.status = status | flags;
        Ok(eval)
    }

    fn max_window_needed(&self) -> usize {
        self.history_window + 1
    }

    fn pre_event_history_count(&self) -> usize {
        self.pre_event_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Vec<DataChannel> {
        let mut ch = DataChannel::value("PH").with_set_points(None, Some(10.0));
        ch.set_window(6);
        vec![ch]
    }

    fn workflow(chs: &[DataChannel]) -> ZScoreWorkflow {
        let mut wf = ZScoreWorkflow::new("z")
            .with_history_window(5)
            .with_outlier_threshold(3.0)
            .with_bed(3, 0.5, 0.8)
            .with_event_timeout(2);
        for (id, ch) in chs.iter().enumerate() {
            wf.add_channel(id, ch);
        }
        wf
    }

    #[test]
    fn bed_probability_is_a_cdf() {
        assert_eq!(ZScoreWorkflow::bed_probability(0, 6, 0.5), 0.0);
        let all = ZScoreWorkflow::bed_probability(6, 6, 0.5);
        assert!((all - (1.0 - 1.0 / 64.0)).abs() < 1e-12);
        assert!(ZScoreWorkflow::bed_probability(2, 6, 0.5) < all);
        assert_eq!(ZScoreWorkflow::bed_probability(7, 6, 0.5), 1.0);
    }

    #[test]
    fn warms_up_then_detects_and_times_out() {
        let mut chs = channels();
        let mut wf = workflow(&chs);
        let mut statuses = Vec::new();
        let series = [7.0, 7.1, 6.9, 7.0, 7.1, 7.0, 12.0, 12.5, 13.0, 12.8, 12.9];
        for (i, v) in series.iter().enumerate() {
            chs[0].record(i as i64, Some(*v)).unwrap();
            statuses.push(wf.evaluate_workflow(i as i64, &chs).unwrap().status);
        }
        assert!(statuses[..5].iter().all(|s| s.contains(EventStatus::UNINITIALIZED)));
        assert_eq!(statuses[5], EventStatus::NORMAL);
        assert!(statuses[6].contains(EventStatus::OUTLIER_DETECTED));
        assert!(statuses.iter().any(|s| s.contains(EventStatus::POSSIBLE_EVENT)));
        assert!(statuses.iter().any(|s| s.contains(EventStatus::EVENT_TIMEOUT)));
    }

    #[test]
    fn missing_values_are_reported() {
        let mut chs = channels();
        let mut wf = workflow(&chs).with_history_window(2);
        for i in 0..2 {
            chs[0].record(i, Some(1.0)).unwrap();
            wf.evaluate_workflow(i, &chs).unwrap();
        }
        chs[0].record(2, None).unwrap();
        let eval = wf.evaluate_workflow(2, &chs).unwrap();
        assert!(eval.status.contains(EventStatus::DATA_MISSING));
        assert!(eval.is_consistent(1));
    }

    #[test]
    fn options_are_validated() {
        let desc = Descriptor::new("z", "zscore").with_option("outlier_probability", 1.5);
        assert!(matches!(
            ZScoreWorkflow::from_descriptor(&desc),
            Err(ConfigurationError::InvalidOption { ref option, .. }) if option == "outlier_probability"
        ));
        let ok = Descriptor::new("z", "zscore")
            .with_option("history_window", 10)
            .with_option("bed_window", 4);
        let wf = ZScoreWorkflow::from_descriptor(&ok).unwrap();
        assert_eq!(wf.max_window_needed(), 11);
        assert_eq!(wf.pre_event_history_count(), 10);
    }
}
