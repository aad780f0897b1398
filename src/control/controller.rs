use crate::component::Descriptor;
use crate::control::inputs::{ControlCommand, ControllerHandle};
use crate::engine::{CallReport, Engine};
use crate::error::ConfigurationError;
use crate::io::base::BaseRx;
use crate::io::ringbuffer::{RingBuffer, RingReceiver};
use crate::step::{Step, StepKind};
use crate::utils::{CancelToken, HealthFlag};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};

const COMMAND_CAPACITY: usize = 64;
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Drives the step sequence, calling the engine once per step.
///
/// The engine owns its controller and lends itself back for the duration of
/// [`Controller::run`].
pub trait Controller: Send {
    fn configure(&mut self, desc: &Descriptor) -> Result<(), ConfigurationError>;

    /// Axis every component's base step is copied from.
    fn base_step(&self) -> Step;

    fn handle(&self) -> ControllerHandle;

    /// Runs until the last step, a stop command, or an engine error.
    fn run(&mut self, engine: &Engine) -> anyhow::Result<RunSummary>;
}

/// How steps are spaced in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Back to back.
    Batch,
    /// Fixed sleep after every step.
    Fixed(Duration),
    /// Each date/time step runs once the wall clock passes its end, checked
    /// every `poll`.
    RealTime(Duration),
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub failed_tasks: u64,
    pub first_index: Option<i64>,
    pub last_index: Option<i64>,
    pub stopped: bool,
}

impl RunSummary {
    fn absorb(&mut self, index: i64, report: &CallReport) {
        self.steps += 1;
        self.failed_tasks += report.failed() as u64;
        self.first_index.get_or_insert(index);
        self.last_index = Some(index);
    }
}

/// Steps from `start` to `stop` (inclusive) on a configured axis. Without a
/// stop index the run lasts until stopped.
pub struct StepController {
    base: Step,
    start: i64,
    stop: Option<i64>,
    pacing: Pacing,
    rx: RingReceiver<ControlCommand>,
    handle: ControllerHandle,
    running: HealthFlag,
    paused: HealthFlag,
    cancel: CancelToken,
}

impl Default for StepController {
    fn default() -> Self {
        Self::new()
    }
}

impl StepController {
    pub fn new() -> Self {
        let (tx, rx) = RingBuffer::bounded(COMMAND_CAPACITY);
        let running = HealthFlag::new(false);
        let paused = HealthFlag::new(false);
        let cancel = CancelToken::new_root();
        let handle = ControllerHandle::new(tx, running.clone(), paused.clone(), cancel.clone());
        Self {
            base: Step::integer(0, 1),
            start: 0,
            stop: None,
            pacing: Pacing::Batch,
            rx,
            handle,
            running,
            paused,
            cancel,
        }
    }

    pub fn with_axis(mut self, base: Step) -> Self {
        self.base = base.at_index(0);
        self
    }

    pub fn with_range(mut self, start: i64, stop: Option<i64>) -> Self {
        self.start = start;
        self.stop = stop;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    #[inline]
    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    #[inline]
    pub fn range(&self) -> (i64, Option<i64>) {
        (self.start, self.stop)
    }

    /// Applies queued commands. Returns false once stopped.
    fn poll_commands(&mut self) -> bool {
        for cmd in self.rx.drain(COMMAND_CAPACITY) {
            match cmd {
                ControlCommand::Pause => {
                    tracing::info!("[Controller] paused");
                    self.paused.up();
                }
                ControlCommand::Resume => {
                    tracing::info!("[Controller] resumed");
                    self.paused.down();
                }
                ControlCommand::Stop => {
                    tracing::info!("[Controller] stop requested");
                    self.cancel.cancel();
                }
            }
        }
        !self.cancel.is_cancelled()
    }

    /// Blocks until `step` may be evaluated. Returns false once stopped.
    fn pace_before(&mut self, step: &Step) -> bool {
        let Pacing::RealTime(poll) = self.pacing else {
            return true;
        };
        let Some(end) = step.end_time() else {
            return true;
        };
        loop {
            let now = Utc::now();
            if now >= end {
                return true;
            }
            let wait = (end - now).to_std().unwrap_or(Duration::ZERO).min(poll);
            if !self.cancel.sleep_cancellable(wait) || !self.poll_commands() {
                return false;
            }
        }
    }

    fn parse_axis(desc: &Descriptor) -> Result<Step, ConfigurationError> {
        let opts = &desc.options;
        let invalid = |reason: String| ConfigurationError::InvalidStep(format!("{}: {reason}", desc.name));
        let kind: StepKind = match opts.get("step_type") {
            None => StepKind::Integer,
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| invalid(format!("unknown step_type: {e}")))?,
        };
        let format = opts.str("format").unwrap_or_default().to_string();

        let step = match kind {
            StepKind::Integer => {
                let stride = opts.i64("stride").unwrap_or(1);
                if stride == 0 {
                    return Err(invalid("stride must be nonzero".into()));
                }
                Step::integer(opts.i64("origin").unwrap_or(0), stride)
            }
            StepKind::Real => {
                let stride = opts.f64("stride").unwrap_or(1.0);
                if stride == 0.0 || !stride.is_finite() {
                    return Err(invalid("stride must be finite and nonzero".into()));
                }
                Step::real(opts.f64("origin").unwrap_or(0.0), stride, opts.usize("decimals"))
            }
            StepKind::DateTime => {
                let secs = opts.f64("stride").unwrap_or(60.0);
                let stride = TimeDelta::milliseconds((secs * 1000.0).round() as i64);
                if stride.is_zero() {
                    return Err(invalid("stride must be at least one millisecond".into()));
                }
                let origin_text = opts.require_str(&desc.name, "origin")?;
                let origin = Step::date_time(DateTime::<Utc>::UNIX_EPOCH, stride, format.clone())
                    .parse_on_axis(origin_text)
                    .map_err(invalid)?;
                let Step::DateTime(axis) = origin else {
                    return Err(invalid("origin is not a date/time".into()));
                };
                Step::date_time(*axis.value(), stride, format)
            }
        };
        Ok(step)
    }

    /// Numbers are step indices; strings are values on the axis.
    fn parse_position(base: &Step, desc: &Descriptor, key: &str) -> Result<Option<i64>, ConfigurationError> {
        match desc.options.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => base
                .parse_on_axis(text)
                .map(|s| Some(s.index()))
                .map_err(|e| ConfigurationError::InvalidOption {
                    component: desc.name.clone(),
                    option: key.to_string(),
                    reason: e,
                }),
            Some(_) => desc.options.i64(key).map(Some).ok_or_else(|| ConfigurationError::InvalidOption {
                component: desc.name.clone(),
                option: key.to_string(),
                reason: "expected a step index or value".into(),
            }),
        }
    }
}

impl Controller for StepController {
    fn configure(&mut self, desc: &Descriptor) -> Result<(), ConfigurationError> {
        self.base = Self::parse_axis(desc)?;
        self.start = Self::parse_position(&self.base, desc, "start")?.unwrap_or(0);
        self.stop = Self::parse_position(&self.base, desc, "stop")?;

        let poll = Duration::from_millis(desc.options.usize("poll_ms").unwrap_or(1000) as u64);
        self.pacing = match desc.options.str("pacing").unwrap_or("batch") {
            "batch" => Pacing::Batch,
            "fixed" => Pacing::Fixed(poll),
            "realtime" | "real_time" => Pacing::RealTime(poll),
            other => {
                return Err(ConfigurationError::InvalidOption {
                    component: desc.name.clone(),
                    option: "pacing".into(),
                    reason: format!("unknown pacing `{other}`"),
                });
            }
        };
        if matches!(self.pacing, Pacing::RealTime(_)) && self.base.kind() != StepKind::DateTime {
            return Err(ConfigurationError::InvalidOption {
                component: desc.name.clone(),
                option: "pacing".into(),
                reason: "real-time pacing needs a datetime step axis".into(),
            });
        }
        Ok(())
    }

    fn base_step(&self) -> Step {
        self.base.clone()
    }

    fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    fn run(&mut self, engine: &Engine) -> anyhow::Result<RunSummary> {
        let mut summary = RunSummary::default();
        if self.cancel.is_cancelled() {
            summary.stopped = true;
            return Ok(summary);
        }

        self.running.up();
        tracing::info!(
            start = self.start,
            stop = ?self.stop,
            pacing = ?self.pacing,
            "[Controller] run started at {}",
            self.base.at_index(self.start)
        );

        let mut index = self.start;
        let started = Instant::now();
        let result = loop {
            if !self.poll_commands() {
                summary.stopped = true;
                break Ok(());
            }
            if self.paused.get() {
                self.cancel.sleep_cancellable(PAUSE_POLL);
                continue;
            }
            if self.stop.is_some_and(|stop| index > stop) {
                break Ok(());
            }

            let step = self.base.at_index(index);
            if !self.pace_before(&step) {
                summary.stopped = true;
                break Ok(());
            }

            match engine.call(&step) {
                Ok(report) => summary.absorb(index, &report),
                Err(e) => break Err(anyhow::Error::new(e).context(format!("step {step} failed"))),
            }
            index += 1;

            if let Pacing::Fixed(poll) = self.pacing {
                self.cancel.sleep_cancellable(poll);
            }
        };

        self.running.down();
        tracing::info!(
            steps = summary.steps,
            failed_tasks = summary.failed_tasks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[Controller] run finished"
        );
        result.map(|()| summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configures_integer_axis_by_default() {
        let mut ctl = StepController::new();
        ctl.configure(&Descriptor::new("c", "step_controller").with_option("stop", 9))
            .unwrap();
        assert_eq!(ctl.base_step().kind(), StepKind::Integer);
        assert_eq!(ctl.range(), (0, Some(9)));
        assert_eq!(ctl.pacing(), Pacing::Batch);
    }

    #[test]
    fn datetime_positions_parse_as_values() {
        let desc = Descriptor::new("c", "step_controller")
            .with_option("step_type", "date_time")
            .with_option("origin", "2024-01-01T00:00:00Z")
            .with_option("stride", 300)
            .with_option("start", "2024-01-01T01:00:00Z")
            .with_option("stop", "2024-01-01T02:00:00Z")
            .with_option("pacing", "realtime")
            .with_option("poll_ms", 10);
        let mut ctl = StepController::new();
        ctl.configure(&desc).unwrap();
        assert_eq!(ctl.range(), (12, Some(24)));
        assert_eq!(ctl.pacing(), Pacing::RealTime(Duration::from_millis(10)));
        assert_eq!(
            ctl.base_step().at_index(1).to_string(),
            "2024-01-01T00:05:00+00:00"
        );
    }

    #[test]
    fn zero_stride_is_rejected() {
        let mut ctl = StepController::new();
        let desc = Descriptor::new("c", "step_controller").with_option("stride", 0);
        assert!(matches!(
            ctl.configure(&desc),
            Err(ConfigurationError::InvalidStep(_))
        ));
        let rt = Descriptor::new("c", "step_controller").with_option("pacing", "realtime");
        assert!(ctl.configure(&rt).is_err());
    }

    #[test]
    fn commands_toggle_flags() {
        let mut ctl = StepController::new();
        let handle = ctl.handle();
        assert!(handle.pause());
        assert!(ctl.poll_commands());
        assert!(handle.is_paused());
        assert!(handle.resume());
        assert!(ctl.poll_commands());
        assert!(!handle.is_paused());
        handle.stop();
        assert!(!ctl.poll_commands());
        assert!(handle.is_stopped());
    }
}
