//! Component model: descriptors, mailboxes, capability traits and the
//! name-keyed factory that builds components from configuration.

mod descriptor;
mod mailbox;
mod messagable;
mod registry;

pub use descriptor::{Descriptor, Options};
pub use mailbox::Mailbox;
pub use messagable::{
    AsAny, ConnectionKind, ConnectionKinds, InputConnection, Messagable, MessagableCore,
    ModelConnection, OutputConnection,
};
pub use registry::{ComponentRegistry, ControllerCtor, MessagableCtor, WorkflowCtor};

use crate::config::EngineContext;
use ahash::AHashSet;
use std::cell::RefCell;

/// What a component can see while it configures itself. Channel and workflow
/// lookups are remembered so the engine can flag unused definitions.
pub struct ConfigureCtx<'a> {
    pub registry: &'a ComponentRegistry,
    pub engine: &'a EngineContext,
    pub channels: &'a [Descriptor],
    pub workflows: &'a [Descriptor],
    resolved: RefCell<AHashSet<String>>,
}

impl<'a> ConfigureCtx<'a> {
    pub fn new(
        registry: &'a ComponentRegistry,
        engine: &'a EngineContext,
        channels: &'a [Descriptor],
        workflows: &'a [Descriptor],
    ) -> Self {
        Self {
            registry,
            engine,
            channels,
            workflows,
            resolved: RefCell::new(AHashSet::new()),
        }
    }

    pub fn channel(&self, name: &str) -> Option<&'a Descriptor> {
        let found = self.channels.iter().find(|d| d.name == name)?;
        self.resolved.borrow_mut().insert(format!("channel:{name}"));
        Some(found)
    }

    pub fn workflow(&self, name: &str) -> Option<&'a Descriptor> {
        let found = self.workflows.iter().find(|d| d.name == name)?;
        self.resolved.borrow_mut().insert(format!("workflow:{name}"));
        Some(found)
    }

    pub fn channel_resolved(&self, name: &str) -> bool {
        self.resolved.borrow().contains(&format!("channel:{name}"))
    }

    pub fn workflow_resolved(&self, name: &str) -> bool {
        self.resolved.borrow().contains(&format!("workflow:{name}"))
    }
}
