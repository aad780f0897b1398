use crate::component::{
    ConfigureCtx, Descriptor, InputConnection, Messagable, MessagableCore, OutputConnection,
};
use crate::error::ConfigurationError;
use crate::message::Message;
use crate::step::Step;
use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// One replayed reading. `value: None` is emitted as missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub index: i64,
    pub tag: String,
    pub value: Option<f64>,
}

/// Replays a fixed list of samples, emitting each once the controller
/// reaches its step.
pub struct MemoryInput {
    core: MessagableCore,
    samples: Vec<Sample>,
    cursor: usize,
}

impl MemoryInput {
    pub fn new(name: &str) -> Self {
        Self {
            core: MessagableCore::new(name),
            samples: Vec::new(),
            cursor: 0,
        }
    }

    pub fn with_sample(mut self, index: i64, tag: impl Into<String>, value: Option<f64>) -> Self {
        self.push_sample(Sample {
            index,
            tag: tag.into(),
            value,
        });
        self
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.core.mailbox().add_produces([sample.tag.clone()]);
        let pos = self.samples.partition_point(|s| s.index <= sample.index);
        self.samples.insert(pos, sample);
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.cursor
    }

    fn parse_sample(name: &str, raw: &Value) -> Result<Sample, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidOption {
            component: name.to_string(),
            option: "samples".into(),
            reason: format!("expected [index, tag, value], got {raw}"),
        };
        let items = raw.as_array().filter(|a| a.len() == 3).ok_or_else(invalid)?;
        let index = items[0].as_i64().ok_or_else(invalid)?;
        let tag = items[1].as_str().ok_or_else(invalid)?.to_string();
        let value = match &items[2] {
            Value::Null => None,
            v => Some(v.as_f64().ok_or_else(invalid)?),
        };
        Ok(Sample { index, tag, value })
    }
}

impl Messagable for MemoryInput {
    fn core(&self) -> &MessagableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessagableCore {
        &mut self.core
    }

    fn configure(&mut self, desc: &Descriptor, _ctx: &ConfigureCtx<'_>) -> Result<(), ConfigurationError> {
        self.core.apply_descriptor(desc);
        if let Some(raw) = desc.options.get("samples") {
            let list = raw.as_array().ok_or_else(|| ConfigurationError::InvalidOption {
                component: desc.name.clone(),
                option: "samples".into(),
                reason: "expected a list".into(),
            })?;
            for item in list {
                self.push_sample(Self::parse_sample(&desc.name, item)?);
            }
        }
        Ok(())
    }

    fn as_input(&mut self) -> Option<&mut dyn InputConnection> {
        Some(self)
    }
}

impl InputConnection for MemoryInput {
    fn read_input_and_produce_messages(&mut self, until: Option<&Step>) -> anyhow::Result<usize> {
        let base = self
            .core
            .base_step()
            .ok_or_else(|| anyhow!("input `{}` has no base step", self.core.name()))?;
        let limit = until.map(Step::index);

        let mut produced = 0;
        while let Some(sample) = self.samples.get(self.cursor) {
            if limit.is_some_and(|l| sample.index > l) {
                break;
            }
            let step = base.at_index(sample.index);
            let value = sample.value.unwrap_or(f64::NAN);
            self.core
                .mailbox()
                .send(Message::value(sample.tag.clone(), step, value));
            self.cursor += 1;
            produced += 1;
        }
        Ok(produced)
    }
}

/// Collects every consumed message into a buffer shared with the embedder.
pub struct MemoryOutput {
    core: MessagableCore,
    sink: Arc<Mutex<Vec<Message>>>,
}

impl MemoryOutput {
    pub fn new(name: &str) -> Self {
        Self {
            core: MessagableCore::new(name),
            sink: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn consuming<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core.mailbox().add_consumes(tags);
        self
    }

    /// Handle to the captured messages.
    pub fn sink(&self) -> Arc<Mutex<Vec<Message>>> {
        self.sink.clone()
    }
}

impl Messagable for MemoryOutput {
    fn core(&self) -> &MessagableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessagableCore {
        &mut self.core
    }

    fn as_output(&mut self) -> Option<&mut dyn OutputConnection> {
        Some(self)
    }
}

impl OutputConnection for MemoryOutput {
    fn consume_messages_and_write_output(&mut self, until: Option<&Step>) -> anyhow::Result<usize> {
        let inbox = self.core.mailbox().inbox();
        let batch = match until {
            Some(limit) => inbox.drain_until(limit),
            None => inbox.drain(),
        };
        let mut sink = self.sink.lock();
        let mut consumed = 0;
        for msg in batch {
            if self.core.accepts(&msg) {
                sink.push(msg);
                consumed += 1;
            }
        }
        Ok(consumed)
    }
}
