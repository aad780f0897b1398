use crate::station::channel::{ChannelId, DataChannel};
use crate::station::status::EventStatus;

/// Outcome of one workflow step. Every per-channel vector is parallel to the
/// station's channel list.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowEvaluation {
    pub status: EventStatus,
    pub probability: f64,
    pub residuals: Vec<f64>,
    pub violations: Vec<i8>,
    pub contributed: Vec<bool>,
    pub raw: Vec<f64>,
}

impl WorkflowEvaluation {
    /// Neutral evaluation for `channels` channels.
    pub fn new(channels: usize, status: EventStatus) -> Self {
        Self {
            status,
            probability: 0.0,
            residuals: vec![f64::NAN; channels],
            violations: vec![0; channels],
            contributed: vec![false; channels],
            raw: vec![f64::NAN; channels],
        }
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.residuals.len()
    }

    pub fn is_consistent(&self, channels: usize) -> bool {
        self.residuals.len() == channels
            && self.violations.len() == channels
            && self.contributed.len() == channels
            && self.raw.len() == channels
    }
}

/// Event detection algorithm owned by a station.
pub trait Workflow: Send {
    fn name(&self) -> &str;

    /// Called once per channel, in station order, during initialization.
    fn add_channel(&mut self, id: ChannelId, channel: &DataChannel);

    /// Evaluates the step at `index`. Channels have already been brought up
    /// to `index`.
    fn evaluate_workflow(
        &mut self,
        index: i64,
        channels: &[DataChannel],
    ) -> anyhow::Result<WorkflowEvaluation>;

    /// History depth every channel must keep, in steps.
    fn max_window_needed(&self) -> usize;

    /// Steps of quiet history kept in front of an event record.
    fn pre_event_history_count(&self) -> usize;
}
