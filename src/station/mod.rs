//! Station: the per-monitoring-point model. Owns its data channels, feeds
//! them from routed VALUE messages, runs a workflow once per step and keeps
//! the event record history.

mod channel;
mod event;
mod status;
mod workflow;
mod zscore;

pub use channel::{ChannelId, ChannelKind, CompositeOp, DataChannel};
pub use event::{ChannelHistory, EventRecord, EventSummary, TerminationCause};
pub use status::{DataStatus, EventStatus};
pub use workflow::{Workflow, WorkflowEvaluation};
pub use zscore::ZScoreWorkflow;

use crate::component::{
    ConfigureCtx, Descriptor, Messagable, MessagableCore, ModelConnection,
};
use crate::error::{ConfigurationError, InitializationError};
use crate::message::{DecodeError, Message, MessageKind};
use crate::warn_throttled_by;
use ahash::AHashMap;
use anyhow::{Context, anyhow};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, info};

pub const RESULT_EVENT_CODE: &str = "event_code";
pub const RESULT_EVENT_STATUS: &str = "event_status";
pub const RESULT_PROBABILITY: &str = "probability";
pub const RESULT_CONTRIBUTING: &str = "contributing_parameters";
pub const RESULT_WORKFLOW: &str = "workflow";
pub const RESULT_RESIDUALS: &str = "residuals";
pub const RESULT_CONTRIBUTED: &str = "contributed";
pub const RESULT_VIOLATIONS: &str = "violations";
pub const RESULT_PARAMETERS: &str = "parameters";
pub const RESULT_TAGS: &str = "tags";

pub struct Station {
    core: MessagableCore,
    tag: String,
    channels: Vec<DataChannel>,
    by_name: AHashMap<String, ChannelId>,
    by_tag: AHashMap<String, Vec<ChannelId>>,
    workflow: Option<Box<dyn Workflow>>,
    current: Option<EventRecord>,
    events: Vec<EventRecord>,
    arrivals: AHashMap<String, i64>,
    executing: bool,
    initialized: bool,
}

impl Station {
    pub fn new(name: &str) -> Self {
        let core = MessagableCore::new(name);
        core.mailbox().add_produces([name.to_string()]);
        Self {
            core,
            tag: name.to_string(),
            channels: Vec::new(),
            by_name: AHashMap::new(),
            by_tag: AHashMap::new(),
            workflow: None,
            current: None,
            events: Vec::new(),
            arrivals: AHashMap::new(),
            executing: false,
            initialized: false,
        }
    }

    /// Tag the station's RESULT and CONTROL messages carry.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }

    fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
        self.core.mailbox().add_produces([self.tag.clone()]);
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Adds a channel; its tag becomes one this station consumes.
    pub fn add_channel(&mut self, channel: DataChannel) -> Result<ChannelId, ConfigurationError> {
        if self.by_name.contains_key(channel.name()) {
            return Err(ConfigurationError::DuplicateName(channel.name().to_string()));
        }
        let id = self.channels.len();
        self.by_name.insert(channel.name().to_string(), id);
        if !matches!(channel.kind(), ChannelKind::Composite(_)) {
            self.by_tag.entry(channel.tag().to_string()).or_default().push(id);
            self.core.mailbox().add_consumes([channel.tag().to_string()]);
        }
        self.channels.push(channel);
        Ok(id)
    }

    pub fn set_workflow(&mut self, workflow: Box<dyn Workflow>) {
        self.workflow = Some(workflow);
    }

    #[inline]
    pub fn channels(&self) -> &[DataChannel] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&DataChannel> {
        self.by_name.get(name).map(|id| &self.channels[*id])
    }

    pub fn workflow_name(&self) -> Option<&str> {
        self.workflow.as_deref().map(|w| w.name())
    }

    #[inline]
    pub fn is_executing(&self) -> bool {
        self.executing
    }

    /// Last step index each tag delivered a value for.
    pub fn last_arrival(&self, tag: &str) -> Option<i64> {
        self.arrivals.get(tag).copied()
    }

    /// Completed events plus the open one once it has been persisted.
    pub fn get_events(&self) -> Vec<EventRecord> {
        let mut out = self.events.clone();
        if let Some(current) = self.current.as_ref().filter(|c| c.is_persisted()) {
            out.push(current.clone());
        }
        out
    }

    pub fn summaries(&self) -> Vec<EventSummary> {
        self.get_events().iter().map(EventRecord::summarize).collect()
    }

    #[inline]
    pub fn current_record(&self) -> Option<&EventRecord> {
        self.current.as_ref()
    }

    /// Decodes a bridge-encoded message onto this station's step axis and
    /// queues it for the next evaluation.
    pub fn push_json_to_inbox(&self, text: &str) -> Result<(), DecodeError> {
        let msg = Message::from_json(text, self.core.base_step())?;
        self.core.mailbox().inbox().push(msg);
        Ok(())
    }

    /// Takes the oldest outgoing message, waiting up to `timeout`.
    pub fn pop_json_from_outbox(&self, timeout: Duration) -> Option<String> {
        self.core
            .mailbox()
            .outbox()
            .pop_timeout(timeout)
            .map(|msg| msg.to_json().to_string())
    }

    fn evaluate_step(&mut self) -> anyhow::Result<()> {
        let step = self
            .core
            .current_step()
            .cloned()
            .ok_or_else(|| anyhow!("no current step"))?;
        let index = step.index();

        for msg in self.core.mailbox().inbox().drain_until(&step) {
            if !self.core.accepts(&msg) {
                continue;
            }
            match msg.kind {
                MessageKind::Value => self.ingest(&msg),
                MessageKind::Control => {
                    debug!(station = %self.core.name(), tag = %msg.tag, "[Station] control message ignored");
                }
                MessageKind::Result => {}
            }
        }

        for ch in self.channels.iter_mut() {
            ch.sync(index);
        }
        for id in 0..self.channels.len() {
            if !matches!(self.channels[id].kind(), ChannelKind::Composite(_)) {
                continue;
            }
            let inputs = self.channels[id]
                .links()
                .map(|l| self.channels[l].value_at(index))
                .collect::<Result<Vec<_>, _>>()?;
            self.channels[id].derive(index, &inputs)?;
        }

        let workflow = self
            .workflow
            .as_deref_mut()
            .ok_or_else(|| anyhow!("no workflow"))?;
        let eval = workflow
            .evaluate_workflow(index, &self.channels)
            .with_context(|| format!("workflow `{}` failed at step {step}", workflow.name()))?;
        if !eval.is_consistent(self.channels.len()) {
            anyhow::bail!(
                "workflow `{}` returned {} channel results for {} channels",
                workflow.name(),
                eval.channel_count(),
                self.channels.len()
            );
        }
        let workflow_name = workflow.name().to_string();

        let statuses: Vec<DataStatus> = self.channels.iter().map(DataChannel::status).collect();
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| anyhow!("station is not initialized"))?;
        if current.add_step(&step, &eval, &statuses) {
            info!(station = %self.core.name(), step = %step, "[Station] possible event opened");
        }
        if current.is_completed() {
            let next = current.successor();
            if let Some(done) = self.current.replace(next).filter(EventRecord::is_persisted) {
                info!(
                    station = %self.core.name(),
                    step = %step,
                    cause = ?done.termination(),
                    "[Station] event closed"
                );
                self.events.push(done);
            }
        }

        let result = self.result_data(&eval, &workflow_name);
        self.core
            .mailbox()
            .send(Message::result(self.tag.clone(), step, result));
        Ok(())
    }

    fn ingest(&mut self, msg: &Message) {
        let Some(index) = msg.step_index() else {
            return;
        };
        let Some(ids) = self.by_tag.get(&msg.tag) else {
            return;
        };
        for &id in ids {
            if let Err(e) = self.channels[id].record(index, msg.number()) {
                warn_throttled_by!(
                    self.core.name(),
                    Duration::from_secs(5),
                    station = %self.core.name(),
                    channel = %self.channels[id].name(),
                    "[Station] late value dropped: {e}"
                );
            }
        }
        let last = self.arrivals.entry(msg.tag.clone()).or_insert(index);
        *last = (*last).max(index);
    }

    fn result_data(&self, eval: &WorkflowEvaluation, workflow: &str) -> Map<String, Value> {
        let contributing = self
            .channels
            .iter()
            .zip(&eval.contributed)
            .filter(|(_, c)| **c)
            .map(|(ch, _)| ch.name())
            .collect::<Vec<_>>()
            .join(" ");

        let mut data = Map::new();
        data.insert(RESULT_EVENT_CODE.into(), json!(eval.status.code()));
        data.insert(RESULT_EVENT_STATUS.into(), json!(eval.status.to_string()));
        data.insert(
            RESULT_PROBABILITY.into(),
            crate::message::finite_or_null(eval.probability),
        );
        data.insert(RESULT_CONTRIBUTING.into(), json!(contributing));
        data.insert(RESULT_WORKFLOW.into(), json!(workflow));
        data.insert(
            RESULT_RESIDUALS.into(),
            Value::Array(
                eval.residuals
                    .iter()
                    .map(|r| crate::message::finite_or_null(*r))
                    .collect(),
            ),
        );
        data.insert(
            RESULT_CONTRIBUTED.into(),
            json!(eval.contributed.iter().map(|c| u8::from(*c)).collect::<Vec<_>>()),
        );
        data.insert(RESULT_VIOLATIONS.into(), json!(eval.violations));
        data.insert(
            RESULT_PARAMETERS.into(),
            json!(self.channels.iter().map(DataChannel::name).collect::<Vec<_>>()),
        );
        data.insert(
            RESULT_TAGS.into(),
            json!(self.channels.iter().map(DataChannel::tag).collect::<Vec<_>>()),
        );
        data
    }
}

impl Messagable for Station {
    fn core(&self) -> &MessagableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessagableCore {
        &mut self.core
    }

    fn configure(&mut self, desc: &Descriptor, ctx: &ConfigureCtx<'_>) -> Result<(), ConfigurationError> {
        self.core.apply_descriptor(desc);
        self.set_tag(desc.tag_or_name());

        for name in desc.options.str_list("channels") {
            let channel_desc = ctx.channel(&name).ok_or_else(|| ConfigurationError::UnknownReference {
                component: desc.name.clone(),
                kind: "channel",
                name: name.clone(),
            })?;
            let channel = ctx.registry.new_channel(channel_desc)?;
            self.add_channel(channel)?;
        }

        if let Some(name) = desc.options.str("workflow") {
            let wf_desc = ctx.workflow(name).ok_or_else(|| ConfigurationError::UnknownReference {
                component: desc.name.clone(),
                kind: "workflow",
                name: name.to_string(),
            })?;
            self.set_workflow(ctx.registry.new_workflow(wf_desc)?);
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), InitializationError> {
        let name = self.core.name().to_string();
        if self.channels.is_empty() {
            return Err(InitializationError::NoChannels(name));
        }
        let Some(workflow) = self.workflow.as_deref_mut() else {
            return Err(InitializationError::NoWorkflow(name));
        };

        let window = workflow.max_window_needed().max(1);
        for id in 0..self.channels.len() {
            let requires = self.channels[id].requires().to_vec();
            for required in requires {
                if let Some(&target) = self.by_name.get(&required) {
                    self.channels[id].link_channel(&required, target);
                }
            }
            self.channels[id].initialize()?;
            self.channels[id].set_window(window);
        }
        for (id, ch) in self.channels.iter().enumerate() {
            workflow.add_channel(id, ch);
        }

        let names = self.channels.iter().map(|c| c.name().to_string()).collect();
        let history = workflow.pre_event_history_count();
        self.current = Some(EventRecord::new(names, Some(history)));
        self.events.clear();
        self.arrivals.clear();
        self.initialized = true;

        debug!(
            station = %name,
            channels = self.channels.len(),
            workflow = %workflow.name(),
            window,
            "[Station] initialized"
        );
        Ok(())
    }

    fn as_model(&mut self) -> Option<&mut dyn ModelConnection> {
        Some(self)
    }
}

impl ModelConnection for Station {
    fn evaluate_model(&mut self) -> i32 {
        if !self.initialized {
            self.core.mailbox().send(Message::control(
                self.tag.clone(),
                self.core.current_step().cloned(),
                1,
                "station is not initialized",
            ));
            return 1;
        }

        self.executing = true;
        let code = match self.evaluate_step() {
            Ok(()) => 0,
            Err(e) => {
                warn_throttled_by!(
                    self.core.name(),
                    Duration::from_secs(5),
                    station = %self.core.name(),
                    "[Station] evaluation failed: {e:#}"
                );
                self.core.mailbox().send(Message::control(
                    self.tag.clone(),
                    self.core.current_step().cloned(),
                    1,
                    format!("{e:#}"),
                ));
                1
            }
        };
        self.executing = false;
        code
    }
}

impl std::fmt::Debug for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Station")
            .field("name", &self.core.name())
            .field("tag", &self.tag)
            .field("channels", &self.channels.len())
            .field("workflow", &self.workflow_name())
            .field("events", &self.events.len())
            .finish()
    }
}
