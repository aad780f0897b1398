use crate::component::{ConfigureCtx, Descriptor, Messagable, MessagableCore, OutputConnection};
use crate::error::{ConfigurationError, InitializationError};
use crate::message::MessageKind;
use crate::step::Step;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Appends consumed messages to a file, one bridge-encoded JSON object per
/// line. VALUE messages are skipped unless `include_values` is set.
pub struct JsonLinesOutput {
    core: MessagableCore,
    path: Option<PathBuf>,
    append: bool,
    include_values: bool,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesOutput {
    pub fn new(name: &str) -> Self {
        Self {
            core: MessagableCore::new(name),
            path: None,
            append: false,
            include_values: false,
            writer: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn consuming<I, S>(self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core.mailbox().add_consumes(tags);
        self
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

impl Messagable for JsonLinesOutput {
    fn core(&self) -> &MessagableCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MessagableCore {
        &mut self.core
    }

    fn configure(&mut self, desc: &Descriptor, ctx: &ConfigureCtx<'_>) -> Result<(), ConfigurationError> {
        self.core.apply_descriptor(desc);
        let path = desc.options.require_str(&desc.name, "path")?;
        self.path = Some(ctx.engine.resolve(path));
        self.append = desc.options.bool("append").unwrap_or(false);
        self.include_values = desc.options.bool("include_values").unwrap_or(false);
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), InitializationError> {
        let name = self.core.name().to_string();
        let path = self.path.clone().ok_or_else(|| InitializationError::Component {
            component: name.clone(),
            reason: "no output path".into(),
        })?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&path)
            .map_err(|e| InitializationError::Component {
                component: name,
                reason: format!("cannot open {}: {e}", path.display()),
            })?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn as_output(&mut self) -> Option<&mut dyn OutputConnection> {
        Some(self)
    }
}

impl OutputConnection for JsonLinesOutput {
    fn consume_messages_and_write_output(&mut self, until: Option<&Step>) -> anyhow::Result<usize> {
        let inbox = self.core.mailbox().inbox();
        let batch = match until {
            Some(limit) => inbox.drain_until(limit),
            None => inbox.drain(),
        };
        let writer = self
            .writer
            .as_mut()
            .with_context(|| format!("output `{}` is not initialized", self.core.name()))?;

        let mut written = 0;
        for msg in batch {
            if !self.core.accepts(&msg) || (msg.kind == MessageKind::Value && !self.include_values) {
                continue;
            }
            serde_json::to_writer(&mut *writer, &msg.to_json())?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush().context("flushing json lines output")?;
        Ok(written)
    }
}

impl Drop for JsonLinesOutput {
    fn drop(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::{Map, Value};

    #[test]
    fn writes_results_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut out = JsonLinesOutput::new("log")
            .with_path(&path)
            .consuming(["S1"]);
        out.initialize().unwrap();

        let base = Step::integer(0, 1);
        let inbox = out.mailbox();
        inbox.inbox().push(Message::value("S1", base.at_index(0), 1.0));
        inbox.inbox().push(Message::result("S1", base.at_index(0), Map::new()));
        inbox
            .inbox()
            .push(Message::control("S1", Some(base.at_index(1)), 1, "diverged"));

        assert_eq!(out.consume_messages_and_write_output(None).unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "RESULT");
        assert_eq!(lines[1]["type"], "CONTROL");
        assert_eq!(lines[1]["step"], "1");
    }

    #[test]
    fn consuming_before_initialize_fails() {
        let mut out = JsonLinesOutput::new("log");
        assert!(out.consume_messages_and_write_output(None).is_err());
        assert!(matches!(
            out.initialize(),
            Err(InitializationError::Component { .. })
        ));
    }
}
