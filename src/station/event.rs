use crate::station::status::{DataStatus, EventStatus};
use crate::station::workflow::WorkflowEvaluation;
use crate::step::Step;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-channel history inside an [`EventRecord`], parallel to its steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelHistory {
    pub raw: Vec<f64>,
    pub residuals: Vec<f64>,
    pub contributed: Vec<bool>,
    pub limit_violations: Vec<i8>,
    pub status: Vec<DataStatus>,
}

impl ChannelHistory {
    fn drain_front(&mut self, n: usize) {
        self.raw.drain(..n);
        self.residuals.drain(..n);
        self.contributed.drain(..n);
        self.limit_violations.drain(..n);
        self.status.drain(..n);
    }
}

/// How an event record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationCause {
    /// Event timed out.
    #[serde(rename = "ETO")]
    Timeout,
    /// Event was identified by the workflow.
    #[serde(rename = "ID")]
    Identified,
    /// Station returned to normal.
    #[serde(rename = "RTN")]
    ReturnToNormal,
}

/// Fixed-shape report of one event record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    pub start: Option<String>,
    pub end: Option<String>,
    pub duration: usize,
    pub termination: TerminationCause,
    pub completed: bool,
    pub contributions: BTreeMap<String, usize>,
}

/// Accumulated history of one candidate or actual anomaly episode.
///
/// Positions (`start_index`, `final_index`) are offsets into the record's
/// own step list, not step indices.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    channel_names: Vec<String>,
    steps: Vec<Step>,
    probability: Vec<f64>,
    status: Vec<EventStatus>,
    channels: Vec<ChannelHistory>,
    start_index: Option<usize>,
    final_index: Option<usize>,
    num_outliers: usize,
    has_non_normal: bool,
    persisted: bool,
    completed: bool,
    timed_out: bool,
    history_limit: Option<usize>,
}

impl EventRecord {
    /// `history_limit` caps the quiet history kept before an event opens.
    pub fn new(channel_names: Vec<String>, history_limit: Option<usize>) -> Self {
        let channels = vec![ChannelHistory::default(); channel_names.len()];
        Self {
            channel_names,
            steps: Vec::new(),
            probability: Vec::new(),
            status: Vec::new(),
            channels,
            start_index: None,
            final_index: None,
            num_outliers: 0,
            has_non_normal: false,
            persisted: false,
            completed: false,
            timed_out: false,
            history_limit,
        }
    }

    /// Fresh record for the same channels and history limit.
    pub fn successor(&self) -> Self {
        Self::new(self.channel_names.clone(), self.history_limit)
    }

    /// Appends one evaluated step and applies the status transitions.
    /// Returns `true` when this step opened an event.
    pub fn add_step(
        &mut self,
        step: &Step,
        eval: &WorkflowEvaluation,
        channel_status: &[DataStatus],
    ) -> bool {
        if self.completed || eval.status.contains(EventStatus::UNINITIALIZED) {
            return false;
        }

        let previous = self.status.last().copied().unwrap_or(EventStatus::NORMAL);
        let pos = self.steps.len();
        self.steps.push(step.clone());
        self.probability.push(eval.probability);
        self.status.push(eval.status);
        for (i, history) in self.channels.iter_mut().enumerate() {
            history.raw.push(eval.raw.get(i).copied().unwrap_or(f64::NAN));
            history.residuals.push(eval.residuals.get(i).copied().unwrap_or(f64::NAN));
            history.contributed.push(eval.contributed.get(i).copied().unwrap_or(false));
            history.limit_violations.push(eval.violations.get(i).copied().unwrap_or(0));
            history.status.push(channel_status.get(i).copied().unwrap_or(DataStatus::MISSING));
        }

        let status = eval.status;
        let mut opened = false;

        if status.contains(EventStatus::POSSIBLE_EVENT)
            && !previous.contains(EventStatus::POSSIBLE_EVENT)
        {
            opened = !self.persisted;
            self.persisted = true;
            self.has_non_normal = true;
            self.start_index.get_or_insert(pos);
        }
        if status.contains(EventStatus::OUTLIER_DETECTED) {
            self.num_outliers += 1;
            self.final_index = Some(pos);
        }
        if status.intersects(EventStatus::EVENT_IDENTIFIED | EventStatus::POSSIBLE_EVENT) {
            self.final_index = Some(pos);
            self.start_index.get_or_insert(pos);
        }
        if status.contains(EventStatus::EVENT_TIMEOUT) {
            self.final_index = Some(pos);
            self.timed_out = true;
            self.completed = true;
        }
        if status.is_quiet() {
            if self.has_non_normal && eval.probability < 0.5 {
                self.completed = true;
            } else if !self.has_non_normal {
                self.num_outliers = 0;
            }
        }

        if !self.has_non_normal && self.start_index.is_none() {
            self.trim_quiet_history();
        }
        opened
    }

    fn trim_quiet_history(&mut self) {
        let Some(limit) = self.history_limit else {
            return;
        };
        let excess = self.steps.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        self.steps.drain(..excess);
        self.probability.drain(..excess);
        self.status.drain(..excess);
        for history in &mut self.channels {
            history.drain_front(excess);
        }
        self.final_index = self.final_index.and_then(|f| f.checked_sub(excess));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[inline]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[inline]
    pub fn probabilities(&self) -> &[f64] {
        &self.probability
    }

    #[inline]
    pub fn statuses(&self) -> &[EventStatus] {
        &self.status
    }

    #[inline]
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelHistory> {
        let pos = self.channel_names.iter().position(|n| n == name)?;
        self.channels.get(pos)
    }

    #[inline]
    pub fn start_index(&self) -> Option<usize> {
        self.start_index
    }

    #[inline]
    pub fn final_index(&self) -> Option<usize> {
        self.final_index
    }

    #[inline]
    pub fn num_outliers(&self) -> usize {
        self.num_outliers
    }

    #[inline]
    pub fn has_non_normal_status(&self) -> bool {
        self.has_non_normal
    }

    /// Part of the station's event history.
    #[inline]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn termination(&self) -> TerminationCause {
        if self.timed_out {
            TerminationCause::Timeout
        } else if self
            .status
            .iter()
            .any(|s| s.contains(EventStatus::EVENT_IDENTIFIED))
        {
            TerminationCause::Identified
        } else {
            TerminationCause::ReturnToNormal
        }
    }

    /// Contribution counts cover `max(0, start - outliers)..=final`.
    pub fn summarize(&self) -> EventSummary {
        let (start, end) = match (self.start_index, self.final_index) {
            (Some(s), Some(f)) if f >= s => (Some(s), Some(f)),
            (Some(s), _) => (Some(s), Some(s)),
            _ => (None, None),
        };

        let mut contributions = BTreeMap::new();
        if let (Some(s), Some(f)) = (start, end) {
            let from = s.saturating_sub(self.num_outliers);
            let to = f.min(self.steps.len().saturating_sub(1));
            for (name, history) in self.channel_names.iter().zip(&self.channels) {
                let count = history
                    .contributed
                    .get(from..=to)
                    .map(|flags| flags.iter().filter(|c| **c).count())
                    .unwrap_or(0);
                contributions.insert(name.clone(), count);
            }
        }

        EventSummary {
            start: start.and_then(|s| self.steps.get(s)).map(Step::to_string),
            end: end.and_then(|f| self.steps.get(f)).map(Step::to_string),
            duration: match (start, end) {
                (Some(s), Some(f)) => f - s + 1,
                _ => 0,
            },
            termination: self.termination(),
            completed: self.completed,
            contributions,
        }
    }
}
