use crate::router::MessageRouter;
use crate::utils::{CancelToken, HealthFlag, try_pin_core};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Runs [`MessageRouter::run`] continuously on a dedicated thread.
pub struct RouterService {
    cancel: CancelToken,
    alive: HealthFlag,
    join: Option<JoinHandle<()>>,
}

impl RouterService {
    /// Starts the router loop. `poll` is the pause between fixpoint passes.
    pub fn spawn(
        router: Arc<MessageRouter>,
        poll: Duration,
        core_id: Option<usize>,
        cancel: CancelToken,
    ) -> std::io::Result<Self> {
        let alive = HealthFlag::new(true);
        let alive_thread = alive.clone();
        let cancel_thread = cancel.clone();

        let join = thread::Builder::new()
            .name("tidewatch-router".into())
            .spawn(move || {
                if let Some(id) = core_id {
                    match try_pin_core(id) {
                        Ok(id) => tracing::info!("[Router] pinned to core {id}"),
                        Err(e) => tracing::warn!("[Router] core pinning skipped: {e}"),
                    }
                }
                tracing::debug!(poll_us = poll.as_micros() as u64, "[Router] service started");

                while !cancel_thread.is_cancelled() {
                    router.run();
                    if poll.is_zero() {
                        thread::yield_now();
                    } else {
                        cancel_thread.sleep_cancellable(poll);
                    }
                }
                // last sweep so nothing queued before the stop is stranded
                router.run();
                alive_thread.down();
                tracing::debug!("[Router] service stopped");
            })?;

        Ok(Self {
            cancel,
            alive,
            join: Some(join),
        })
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Cancels the loop and waits up to `timeout` for the thread to exit.
    /// Returns false when the thread had to be detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("[Router] service did not stop within {timeout:?}, detaching");
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if join.join().is_err() {
            tracing::error!("[Router] service thread panicked");
        }
        true
    }
}

impl Drop for RouterService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ConnectionKind, Mailbox};
    use crate::message::Message;
    use crate::step::Step;

    #[test]
    fn service_delivers_in_background() {
        let router = Arc::new(MessageRouter::new());
        let p = Arc::new(Mailbox::new("P"));
        let s = Arc::new(Mailbox::new("S"));
        s.add_consumes(["T"]);
        router.register(p.clone(), ConnectionKind::Input).unwrap();
        router.register(s.clone(), ConnectionKind::Model).unwrap();

        let mut svc = RouterService::spawn(
            router.clone(),
            Duration::from_micros(100),
            None,
            CancelToken::new_root(),
        )
        .unwrap();

        p.send(Message::value("T", Step::integer(0, 1), 2.0));
        let seen = router.iterations();
        assert!(router.wait_for_generation(seen + 2, Duration::from_secs(5)));
        assert_eq!(s.inbox().len(), 1);

        assert!(svc.stop(Duration::from_secs(5)));
        assert!(!svc.is_alive());
    }
}
