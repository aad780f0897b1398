use crate::component::{Descriptor, Messagable};
use crate::connectors::{JsonLinesOutput, MemoryInput, MemoryOutput};
use crate::control::{Controller, StepController};
use crate::error::{ComponentClassErrorKind, InvalidComponentClass};
use crate::station::{DataChannel, Station, Workflow, ZScoreWorkflow};
use ahash::AHashMap;

pub type MessagableCtor =
    Box<dyn Fn(&Descriptor) -> anyhow::Result<Box<dyn Messagable>> + Send + Sync>;
pub type ControllerCtor =
    Box<dyn Fn(&Descriptor) -> anyhow::Result<Box<dyn Controller>> + Send + Sync>;
pub type WorkflowCtor = Box<dyn Fn(&Descriptor) -> anyhow::Result<Box<dyn Workflow>> + Send + Sync>;
pub type ChannelCtor = Box<dyn Fn(&Descriptor) -> anyhow::Result<DataChannel> + Send + Sync>;

/// Class-name keyed constructors for every configurable component type.
///
/// Populated once at startup; unknown names fail with
/// [`InvalidComponentClass`].
#[derive(Default)]
pub struct ComponentRegistry {
    messagables: AHashMap<String, MessagableCtor>,
    controllers: AHashMap<String, ControllerCtor>,
    workflows: AHashMap<String, WorkflowCtor>,
    channels: AHashMap<String, ChannelCtor>,
}

impl ComponentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every component class shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();

        reg.register_messagable("station", |d| Ok(Box::new(Station::new(&d.name))));
        reg.register_messagable("memory_input", |d| Ok(Box::new(MemoryInput::new(&d.name))));
        reg.register_messagable("memory_output", |d| {
            Ok(Box::new(MemoryOutput::new(&d.name)))
        });
        reg.register_messagable("jsonl_output", |d| {
            Ok(Box::new(JsonLinesOutput::new(&d.name)))
        });

        reg.register_controller("step_controller", |_| Ok(Box::new(StepController::new())));

        reg.register_workflow("zscore", |d| Ok(Box::new(ZScoreWorkflow::from_descriptor(d)?)));

        for kind in ["value", "alarm", "calibration", "composite"] {
            reg.register_channel(kind, |d| Ok(DataChannel::from_descriptor(d)?));
        }

        reg
    }

    pub fn register_messagable<F>(&mut self, class: impl Into<String>, ctor: F)
    where
        F: Fn(&Descriptor) -> anyhow::Result<Box<dyn Messagable>> + Send + Sync + 'static,
    {
        self.messagables.insert(class.into(), Box::new(ctor));
    }

    pub fn register_controller<F>(&mut self, class: impl Into<String>, ctor: F)
    where
        F: Fn(&Descriptor) -> anyhow::Result<Box<dyn Controller>> + Send + Sync + 'static,
    {
        self.controllers.insert(class.into(), Box::new(ctor));
    }

    pub fn register_workflow<F>(&mut self, class: impl Into<String>, ctor: F)
    where
        F: Fn(&Descriptor) -> anyhow::Result<Box<dyn Workflow>> + Send + Sync + 'static,
    {
        self.workflows.insert(class.into(), Box::new(ctor));
    }

    pub fn register_channel<F>(&mut self, class: impl Into<String>, ctor: F)
    where
        F: Fn(&Descriptor) -> anyhow::Result<DataChannel> + Send + Sync + 'static,
    {
        self.channels.insert(class.into(), Box::new(ctor));
    }

    pub fn new_messagable(
        &self,
        desc: &Descriptor,
    ) -> Result<Box<dyn Messagable>, InvalidComponentClass> {
        self.build(&self.messagables, desc, "messagable")
    }

    pub fn new_controller(
        &self,
        desc: &Descriptor,
    ) -> Result<Box<dyn Controller>, InvalidComponentClass> {
        self.build(&self.controllers, desc, "controller")
    }

    pub fn new_workflow(&self, desc: &Descriptor) -> Result<Box<dyn Workflow>, InvalidComponentClass> {
        self.build(&self.workflows, desc, "workflow")
    }

    pub fn new_channel(&self, desc: &Descriptor) -> Result<DataChannel, InvalidComponentClass> {
        self.build(&self.channels, desc, "data channel")
    }

    fn build<T>(
        &self,
        table: &AHashMap<String, Box<dyn Fn(&Descriptor) -> anyhow::Result<T> + Send + Sync>>,
        desc: &Descriptor,
        capability: &'static str,
    ) -> Result<T, InvalidComponentClass> {
        let class = desc.class_name.as_str();
        match table.get(class) {
            Some(ctor) => ctor(desc).map_err(|e| {
                InvalidComponentClass::new(
                    class,
                    ComponentClassErrorKind::ConstructorFailed(format!("{e:#}")),
                )
            }),
            None if self.knows(class) => Err(InvalidComponentClass::new(
                class,
                ComponentClassErrorKind::WrongCapability(capability),
            )),
            None => Err(InvalidComponentClass::new(
                class,
                ComponentClassErrorKind::UnknownClass,
            )),
        }
    }

    fn knows(&self, class: &str) -> bool {
        self.messagables.contains_key(class)
            || self.controllers.contains_key(class)
            || self.workflows.contains_key(class)
            || self.channels.contains_key(class)
    }
}
