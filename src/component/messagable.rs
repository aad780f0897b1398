use crate::component::{ConfigureCtx, Descriptor, Mailbox, Options};
use crate::error::{ConfigurationError, InitializationError};
use crate::message::Message;
use crate::step::Step;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Capability bucket a node is dispatched under by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Input,
    Model,
    Output,
    Unknown,
}

impl ConnectionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Input => "input",
            ConnectionKind::Model => "model",
            ConnectionKind::Output => "output",
            ConnectionKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which capabilities a component exposes. A component may be several at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionKinds {
    pub input: bool,
    pub model: bool,
    pub output: bool,
}

impl ConnectionKinds {
    pub fn of(component: &mut dyn Messagable) -> Self {
        Self {
            input: component.as_input().is_some(),
            model: component.as_model().is_some(),
            output: component.as_output().is_some(),
        }
    }

    /// Buckets this node belongs to; `Unknown` when it has no capability.
    pub fn buckets(&self) -> Vec<ConnectionKind> {
        let mut out = Vec::with_capacity(3);
        if self.input {
            out.push(ConnectionKind::Input);
        }
        if self.model {
            out.push(ConnectionKind::Model);
        }
        if self.output {
            out.push(ConnectionKind::Output);
        }
        if out.is_empty() {
            out.push(ConnectionKind::Unknown);
        }
        out
    }
}

/// Blanket downcast support so the engine can hand out typed access to
/// registered components.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// State every messagable component embeds: mailbox, options and the step
/// cursor set by the engine.
#[derive(Debug)]
pub struct MessagableCore {
    mailbox: Arc<Mailbox>,
    options: Options,
    base_step: Option<Step>,
    current_step: Option<Step>,
    null_step_ok: bool,
}

impl MessagableCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            mailbox: Arc::new(Mailbox::new(name)),
            options: Options::new(),
            base_step: None,
            current_step: None,
            null_step_ok: false,
        }
    }

    /// Copies options and declared tags from the descriptor.
    pub fn apply_descriptor(&mut self, desc: &Descriptor) {
        self.options = desc.options.clone();
        self.null_step_ok = desc.options.bool("null_step_ok").unwrap_or(false);
        self.mailbox.add_consumes(desc.consumes.iter().cloned());
        self.mailbox.add_produces(desc.produces.iter().cloned());
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.mailbox.name()
    }

    #[inline]
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn base_step(&self) -> Option<&Step> {
        self.base_step.as_ref()
    }

    #[inline]
    pub fn current_step(&self) -> Option<&Step> {
        self.current_step.as_ref()
    }

    #[inline]
    pub fn null_step_ok(&self) -> bool {
        self.null_step_ok
    }

    pub fn set_null_step_ok(&mut self, ok: bool) {
        self.null_step_ok = ok;
    }

    pub fn set_base_step(&mut self, step: Step) {
        self.base_step = Some(step);
    }

    pub fn set_current_step(&mut self, step: Step) {
        self.current_step = Some(step);
    }

    /// Drops a step-less message unless this component allows them.
    pub fn accepts(&self, msg: &Message) -> bool {
        msg.step.is_some() || self.null_step_ok
    }
}

/// Unit of execution: a component with a mailbox and a lifecycle of
/// `configure -> initialize -> repeated phase calls`.
///
/// The engine never runs the same component's task twice concurrently, so
/// implementations need not be reentrant.
pub trait Messagable: AsAny + Send {
    fn core(&self) -> &MessagableCore;
    fn core_mut(&mut self) -> &mut MessagableCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn mailbox(&self) -> Arc<Mailbox> {
        self.core().mailbox().clone()
    }

    fn configure(
        &mut self,
        desc: &Descriptor,
        _ctx: &ConfigureCtx<'_>,
    ) -> Result<(), ConfigurationError> {
        self.core_mut().apply_descriptor(desc);
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), InitializationError> {
        Ok(())
    }

    fn set_base_step(&mut self, step: Step) {
        self.core_mut().set_base_step(step);
    }

    fn set_current_step(&mut self, step: Step) {
        self.core_mut().set_current_step(step);
    }

    fn as_input(&mut self) -> Option<&mut dyn InputConnection> {
        None
    }

    fn as_model(&mut self) -> Option<&mut dyn ModelConnection> {
        None
    }

    fn as_output(&mut self) -> Option<&mut dyn OutputConnection> {
        None
    }
}

/// Produces VALUE messages from external data.
pub trait InputConnection {
    /// Emits messages, restricted to steps at or before `until` when given.
    /// Returns how many messages were produced.
    fn read_input_and_produce_messages(&mut self, until: Option<&Step>) -> anyhow::Result<usize>;
}

/// Consumes VALUE/RESULT messages and produces RESULT messages.
pub trait ModelConnection {
    /// Unix-style status: 0 on success.
    fn evaluate_model(&mut self) -> i32;
}

/// Consumes messages and writes them somewhere outside the engine.
pub trait OutputConnection {
    /// Consumes messages at or before `until` when given. Returns how many
    /// messages were consumed.
    fn consume_messages_and_write_output(&mut self, until: Option<&Step>)
    -> anyhow::Result<usize>;
}
