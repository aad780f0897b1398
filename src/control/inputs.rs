use crate::error::SendFailReason;
use crate::io::base::BaseTx;
use crate::io::ringbuffer::RingSender;
use crate::utils::{CancelToken, HealthFlag};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const COMMAND_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Control-plane command for a running controller. Applied between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

/// Clonable remote for a controller: sends commands and observes state.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: Arc<Mutex<RingSender<ControlCommand>>>,
    running: HealthFlag,
    paused: HealthFlag,
    cancel: CancelToken,
}

impl ControllerHandle {
    pub(crate) fn new(
        tx: RingSender<ControlCommand>,
        running: HealthFlag,
        paused: HealthFlag,
        cancel: CancelToken,
    ) -> Self {
        Self {
            tx: Arc::new(Mutex::new(tx)),
            running,
            paused,
            cancel,
        }
    }

    /// Queues a command, waiting briefly for room in the command ring.
    /// Returns false when the ring stays full or the run is already stopped.
    pub fn send(&self, cmd: ControlCommand) -> bool {
        match self.tx.lock().send(cmd, &self.cancel, Some(COMMAND_SEND_TIMEOUT)) {
            Ok(()) => true,
            Err(e) if e.reason == SendFailReason::Cancelled => {
                tracing::debug!("[Controller] {cmd:?} after stop ignored");
                false
            }
            Err(e) => {
                tracing::warn!("[Controller] dropping {cmd:?}: {e}");
                false
            }
        }
    }

    pub fn pause(&self) -> bool {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(ControlCommand::Resume)
    }

    /// Stops the run after the step in flight. Also wakes a pacing sleep.
    pub fn stop(&self) {
        self.send(ControlCommand::Stop);
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.get()
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("running", &self.running.get())
            .field("paused", &self.paused.get())
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}
