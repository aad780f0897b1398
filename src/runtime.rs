use crate::control::{ControllerHandle, RunSummary};
use crate::engine::Engine;
use crate::utils::{HealthFlag, try_pin_core};
use anyhow::{Result, anyhow};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SIGNAL_POLL: Duration = Duration::from_millis(20);

/// Runs an initialized engine's controller on a dedicated thread.
/// Termination signals stop the controller at the next step boundary.
pub struct Runtime {
    engine: Arc<Engine>,
    handle: ControllerHandle,
    join: Option<JoinHandle<Result<RunSummary>>>,
    watcher: Option<JoinHandle<()>>,
    running: HealthFlag,
}

impl Runtime {
    /// Spawns the run thread and the signal watcher.
    pub fn spawn(engine: Engine) -> Result<Self> {
        if !engine.is_initialized() {
            return Err(anyhow!("[Runtime] engine must be initialized before spawn"));
        }
        let handle = engine
            .controller_handle()
            .ok_or_else(|| anyhow!("[Runtime] engine has no controller"))?;
        let core_id = engine.settings().controller_core_id;
        let engine = Arc::new(engine);
        let running = HealthFlag::new(true);

        let join = {
            let engine = engine.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("tidewatch-runtime".into())
                .spawn(move || {
                    if let Some(id) = core_id {
                        match try_pin_core(id) {
                            Ok(id) => tracing::info!("[Runtime] pinned to core {id}"),
                            Err(e) => tracing::warn!("[Runtime] core pinning skipped: {e}"),
                        }
                    }
                    let result = engine.run();
                    match &result {
                        Ok(summary) => tracing::info!(
                            steps = summary.steps,
                            failed_tasks = summary.failed_tasks,
                            stopped = summary.stopped,
                            "[Runtime] run finished"
                        ),
                        Err(e) => tracing::error!("[Runtime] run failed: {e:#}"),
                    }
                    running.down();
                    result
                })?
        };

        let watcher = {
            let handle = handle.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("tidewatch-signals".into())
                .spawn(move || {
                    let term_flag = Arc::new(AtomicBool::new(false));
                    for sig in TERM_SIGNALS {
                        if let Err(e) = flag::register(*sig, term_flag.clone()) {
                            tracing::warn!("[Runtime] cannot register signal {sig}: {e}");
                        }
                    }
                    while running.get() {
                        if term_flag.load(Ordering::Relaxed) {
                            tracing::warn!("[Runtime] termination signal received");
                            handle.stop();
                            break;
                        }
                        thread::sleep(SIGNAL_POLL);
                    }
                })?
        };

        Ok(Self {
            engine,
            handle,
            join: Some(join),
            watcher: Some(watcher),
            running,
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    #[inline]
    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    /// Shared engine, usable for event queries during and after the run.
    #[inline]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Blocks until the controller finishes.
    pub fn run_blocking(mut self) -> Result<RunSummary> {
        self.join_run()
    }

    /// Stops the controller, waits for the run thread and shuts the engine down.
    pub fn shutdown(mut self) -> Result<RunSummary> {
        self.handle.stop();
        let result = self.join_run();
        self.engine.shutdown();
        result
    }

    /// Wraps the runtime into a guard that stops it on drop.
    pub fn into_guard(self) -> RuntimeGuard {
        RuntimeGuard(Some(self))
    }

    fn join_run(&mut self) -> Result<RunSummary> {
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("[Runtime] run thread already joined"))?;
        let result = join
            .join()
            .map_err(|_| anyhow!("[Runtime] run thread panicked"))
            .and_then(|r| r);
        self.running.down();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        result
    }
}

/// Guard that stops the runtime when dropped.
pub struct RuntimeGuard(Option<Runtime>);

impl RuntimeGuard {
    pub fn runtime(&self) -> Option<&Runtime> {
        self.0.as_ref()
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if let Some(rt) = self.0.take()
            && let Err(e) = rt.shutdown()
        {
            tracing::error!("[Runtime] shutdown: {e:#}");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.handle.stop();
            if let Err(e) = self.join_run() {
                tracing::error!("[Runtime] {e:#}");
            }
        }
    }
}
