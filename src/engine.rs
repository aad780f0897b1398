//! Step scheduler: configures components, registers them with the router and
//! runs the Input, Model and Output phases of every step behind a barrier.

use crate::component::{
    AsAny, ComponentRegistry, ConfigureCtx, ConnectionKind, ConnectionKinds, Descriptor, Mailbox,
    Messagable,
};
use crate::config::{EngineConfig, EngineContext, EngineSettings};
use crate::control::{Controller, ControllerHandle, RunSummary};
use crate::error::{ConfigurationError, EngineError, TaskError};
use crate::pool::WorkerPool;
use crate::router::{MessageRouter, RouterService};
use crate::step::Step;
use crate::utils::CancelToken;
use crate::warn_throttled_by;
use ahash::AHashMap;
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub type ComponentRef = Arc<Mutex<Box<dyn Messagable>>>;

const PHASES: [ConnectionKind; 3] = [
    ConnectionKind::Input,
    ConnectionKind::Model,
    ConnectionKind::Output,
];

/// Outcome of one phase of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: ConnectionKind,
    pub submitted: usize,
    pub failed: usize,
    /// Messages produced by inputs or consumed by outputs.
    pub messages: usize,
}

impl PhaseReport {
    fn new(phase: ConnectionKind) -> Self {
        Self {
            phase,
            submitted: 0,
            failed: 0,
            messages: 0,
        }
    }
}

/// Outcome of one [`Engine::call`].
#[derive(Debug, Clone)]
pub struct CallReport {
    pub step: Step,
    pub input: PhaseReport,
    pub model: PhaseReport,
    pub output: PhaseReport,
    pub elapsed: Duration,
}

impl CallReport {
    pub fn submitted(&self) -> usize {
        self.input.submitted + self.model.submitted + self.output.submitted
    }

    pub fn failed(&self) -> usize {
        self.input.failed + self.model.failed + self.output.failed
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

pub struct Engine {
    registry: ComponentRegistry,
    settings: EngineSettings,
    context: EngineContext,
    router: Arc<MessageRouter>,
    components: RwLock<AHashMap<String, ComponentRef>>,
    order: Vec<String>,
    controller: Mutex<Option<Box<dyn Controller>>>,
    controller_handle: Option<ControllerHandle>,
    pool: Option<WorkerPool>,
    router_service: Mutex<Option<RouterService>>,
    definitions: Vec<Descriptor>,
    cancel: CancelToken,
    initialized: bool,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(ComponentRegistry::with_builtins())
    }
}

impl Engine {
    pub fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry,
            settings: EngineSettings::default(),
            context: EngineContext::default(),
            router: Arc::new(MessageRouter::new()),
            components: RwLock::new(AHashMap::new()),
            order: Vec::new(),
            controller: Mutex::new(None),
            controller_handle: None,
            pool: None,
            router_service: Mutex::new(None),
            definitions: Vec::new(),
            cancel: CancelToken::new_root(),
            initialized: false,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.context = EngineContext::new(settings.base_dir.clone());
        self.settings = settings;
        self
    }

    #[inline]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[inline]
    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    #[inline]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Builds the controller and every component from configuration.
    /// Components are configured here and initialized by [`Engine::initialize`].
    pub fn configure(&mut self, mut config: EngineConfig) -> Result<(), EngineError> {
        self.settings = config.engine;
        self.context = EngineContext::new(self.settings.base_dir.clone());

        if config.controllers.len() != 1 {
            return Err(ConfigurationError::ControllerCount(config.controllers.len()).into());
        }
        let ctl_desc = &config.controllers[0];
        let mut controller = self.registry.new_controller(ctl_desc)?;
        controller.configure(ctl_desc)?;
        self.set_controller(controller);

        let mut built = Vec::with_capacity(config.components.len());
        let (channels_used, workflows_used) = {
            let ctx = ConfigureCtx::new(
                &self.registry,
                &self.context,
                &config.channels,
                &config.workflows,
            );
            for desc in &config.components {
                let mut component = self.registry.new_messagable(desc)?;
                component.configure(desc, &ctx)?;
                built.push(component);
            }
            (
                config.channels.iter().map(|d| ctx.channel_resolved(&d.name)).collect::<Vec<_>>(),
                config.workflows.iter().map(|d| ctx.workflow_resolved(&d.name)).collect::<Vec<_>>(),
            )
        };
        for (desc, used) in config.channels.iter_mut().zip(channels_used) {
            desc.used = used;
        }
        for (desc, used) in config.workflows.iter_mut().zip(workflows_used) {
            desc.used = used;
        }
        for component in built {
            self.add_component(component)?;
        }

        for desc in config.channels.iter().chain(&config.workflows) {
            if !desc.used {
                tracing::warn!("[Engine] `{}` ({}) is defined but never used", desc.name, desc.class_name);
            }
        }
        self.definitions = config.channels;
        self.definitions.append(&mut config.workflows);

        tracing::info!(
            components = self.order.len(),
            workers = self.settings.worker_threads,
            "[Engine] configured"
        );
        Ok(())
    }

    pub fn set_controller(&mut self, controller: Box<dyn Controller>) {
        self.controller_handle = Some(controller.handle());
        *self.controller.lock() = Some(controller);
    }

    pub fn controller_handle(&self) -> Option<ControllerHandle> {
        self.controller_handle.clone()
    }

    /// Adds an already configured component. After initialization the
    /// component is initialized and registered right away.
    pub fn add_component(&mut self, mut component: Box<dyn Messagable>) -> Result<(), EngineError> {
        let name = component.name().to_string();
        if self.components.read().contains_key(&name) {
            return Err(ConfigurationError::DuplicateName(name).into());
        }
        if self.initialized {
            let base = self.base_step()?;
            component.set_base_step(base);
            component.initialize()?;
            self.register(&name, &mut *component);
        }
        self.components
            .write()
            .insert(name.clone(), Arc::new(Mutex::new(component)));
        self.order.push(name);
        Ok(())
    }

    /// Removes a component from the router and the engine.
    pub fn remove_component(&mut self, name: &str) -> Option<ComponentRef> {
        if self.initialized
            && let Err(e) = self.router.deregister(name)
        {
            tracing::warn!("[Engine] {e}");
        }
        self.order.retain(|n| n != name);
        self.components.write().remove(name)
    }

    /// Channel and workflow definitions from the last [`Engine::configure`];
    /// `used` tells whether any station picked them up.
    pub fn definitions(&self) -> &[Descriptor] {
        &self.definitions
    }

    pub fn component_names(&self) -> &[String] {
        &self.order
    }

    pub fn mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.components.read().get(name).map(|c| c.lock().mailbox())
    }

    /// Typed read access to a component, if it exists and is a `T`.
    pub fn with_component<T: 'static, R>(&self, name: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let component = self.components.read().get(name)?.clone();
        let guard = component.lock();
        let inner: &dyn Messagable = &**guard;
        inner.as_any().downcast_ref::<T>().map(f)
    }

    pub fn with_component_mut<T: 'static, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let component = self.components.read().get(name)?.clone();
        let mut guard = component.lock();
        let inner: &mut dyn Messagable = &mut **guard;
        inner.as_any_mut().downcast_mut::<T>().map(f)
    }

    fn base_step(&self) -> Result<Step, EngineError> {
        self.controller
            .lock()
            .as_ref()
            .map(|c| c.base_step())
            .ok_or_else(|| ConfigurationError::ControllerCount(0).into())
    }

    fn register(&self, name: &str, component: &mut dyn Messagable) {
        let kinds = ConnectionKinds::of(component);
        if let Err(e) = self.router.register_kinds(component.mailbox(), kinds) {
            tracing::error!("[Engine] registration of {name} rejected: {e}");
        }
    }

    /// Starts the worker pool and router service, then initializes and
    /// registers every component with the controller's base step.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }
        let base = self.base_step()?;

        let components: Vec<(String, ComponentRef)> = {
            let map = self.components.read();
            self.order
                .iter()
                .filter_map(|n| map.get(n).map(|c| (n.clone(), c.clone())))
                .collect()
        };
        for (name, component) in &components {
            let mut guard = component.lock();
            guard.set_base_step(base.clone());
            guard.initialize()?;
            self.register(name, &mut **guard);
        }

        self.pool = Some(WorkerPool::new(
            self.settings.worker_threads,
            self.cancel.new_child(),
        )?);
        let service = RouterService::spawn(
            self.router.clone(),
            Duration::from_micros(self.settings.router_poll_micros),
            self.settings.router_core_id,
            self.cancel.new_child(),
        )?;
        *self.router_service.lock() = Some(service);
        self.initialized = true;

        tracing::info!(
            inputs = self.router.nodes_in(ConnectionKind::Input).len(),
            models = self.router.nodes_in(ConnectionKind::Model).len(),
            outputs = self.router.nodes_in(ConnectionKind::Output).len(),
            routes = self.router.route_size(),
            "[Engine] initialized at base step {base}"
        );
        Ok(())
    }

    /// Runs one step: Input, then Model, then Output. Each phase waits for
    /// its tasks and then for the router to settle before the next begins.
    pub fn call(&self, step: &Step) -> Result<CallReport, EngineError> {
        let pool = match (&self.pool, self.initialized) {
            (Some(pool), true) => pool,
            _ => return Err(EngineError::NotInitialized),
        };
        let started = Instant::now();

        let [inputs, models, outputs] = PHASES.map(|kind| self.snapshot(kind));
        let input = self.run_phase(pool, ConnectionKind::Input, step, &inputs)?;
        let model = self.run_phase(pool, ConnectionKind::Model, step, &models)?;
        let output = self.run_phase(pool, ConnectionKind::Output, step, &outputs)?;

        let report = CallReport {
            step: step.clone(),
            input,
            model,
            output,
            elapsed: started.elapsed(),
        };
        if !report.is_success() {
            tracing::debug!(step = %step, failed = report.failed(), "[Engine] step finished with failures");
        }
        Ok(report)
    }

    fn snapshot(&self, kind: ConnectionKind) -> Vec<(String, ComponentRef)> {
        let map = self.components.read();
        self.router
            .nodes_in(kind)
            .into_iter()
            .filter_map(|n| map.get(&n).map(|c| (n, c.clone())))
            .collect()
    }

    fn run_phase(
        &self,
        pool: &WorkerPool,
        kind: ConnectionKind,
        step: &Step,
        nodes: &[(String, ComponentRef)],
    ) -> Result<PhaseReport, EngineError> {
        let mut report = PhaseReport::new(kind);
        if nodes.is_empty() {
            return Ok(report);
        }
        let timeout_ms = self.settings.phase_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let mut handles = Vec::with_capacity(nodes.len());
        for (name, component) in nodes {
            component.lock().set_current_step(step.clone());
            let component = component.clone();
            let task_step = step.clone();
            handles.push(pool.submit(name.clone(), move || {
                run_task(kind, &component, &task_step)
            })?);
            report.submitted += 1;
        }

        for handle in handles {
            let name = handle.name().to_string();
            let left = deadline.saturating_duration_since(Instant::now());
            match handle.join(Some(left)) {
                Ok(Ok(n)) => report.messages += n,
                Ok(Err(reason)) => {
                    report.failed += 1;
                    warn_throttled_by!(
                        name,
                        Duration::from_secs(5),
                        "[Engine] {kind} task {name} failed at step {step}: {reason}"
                    );
                }
                Err(TaskError::Timeout) => {
                    return Err(EngineError::BarrierTimeout {
                        phase: kind.as_str(),
                        timeout_ms,
                    });
                }
                Err(TaskError::Cancelled) => return Err(EngineError::PoolClosed),
                Err(e) => {
                    report.failed += 1;
                    warn_throttled_by!(
                        name,
                        Duration::from_secs(5),
                        "[Engine] {kind} task {name} failed at step {step}: {e}"
                    );
                }
            }
        }

        // the pass running when the last task finished may have swept its
        // outbox already; the one after it cannot have
        let seen = self.router.iterations();
        let left = deadline.saturating_duration_since(Instant::now());
        if !self.router.wait_for_generation(seen + 2, left) {
            return Err(EngineError::BarrierTimeout {
                phase: kind.as_str(),
                timeout_ms,
            });
        }
        Ok(report)
    }

    /// Lends the controller this engine and runs it to completion.
    pub fn run(&self) -> anyhow::Result<RunSummary> {
        if !self.initialized {
            return Err(EngineError::NotInitialized.into());
        }
        let mut controller = self
            .controller
            .lock()
            .take()
            .ok_or_else(|| anyhow!("controller is already running"))?;
        let result = controller.run(self);
        *self.controller.lock() = Some(controller);
        result
    }

    /// Stops the controller, router and pool. Messages still queued may be
    /// dropped. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = &self.controller_handle {
            handle.stop();
        }
        let timeout = Duration::from_millis(self.settings.shutdown_timeout_ms);
        if let Some(mut service) = self.router_service.lock().take() {
            service.stop(timeout);
        }
        if let Some(pool) = &self.pool {
            pool.shutdown(timeout);
        }
        self.cancel.cancel();
        tracing::info!("[Engine] shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(kind: ConnectionKind, component: &ComponentRef, step: &Step) -> Result<usize, String> {
    let mut guard = component.lock();
    let name = guard.name().to_string();
    match kind {
        ConnectionKind::Input => match guard.as_input() {
            Some(input) => input
                .read_input_and_produce_messages(Some(step))
                .map_err(|e| format!("{e:#}")),
            None => Err(format!("{name} is not an input")),
        },
        ConnectionKind::Model => match guard.as_model() {
            Some(model) => match model.evaluate_model() {
                0 => Ok(0),
                code => Err(format!("model returned status {code}")),
            },
            None => Err(format!("{name} is not a model")),
        },
        ConnectionKind::Output => match guard.as_output() {
            Some(output) => output
                .consume_messages_and_write_output(Some(step))
                .map_err(|e| format!("{e:#}")),
            None => Err(format!("{name} is not an output")),
        },
        ConnectionKind::Unknown => Ok(0),
    }
}
