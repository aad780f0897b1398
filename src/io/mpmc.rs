use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::IdleBackoff;
use crate::io::base::{BaseRx, BaseTx};
use crate::utils::CancelToken;
use crossbeam::channel as cbchan;
use std::time::{Duration, Instant};

/// Multi-producer multi-consumer channel; feeds the worker pool and carries
/// task results back to the engine.
pub struct MpmcChannel;

impl MpmcChannel {
    #[inline]
    pub fn bounded<T: Send + 'static>(capacity: usize) -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::bounded::<T>(capacity);
        (MpmcSender { tx }, MpmcReceiver { rx })
    }

    #[inline]
    pub fn unbounded<T: Send + 'static>() -> (MpmcSender<T>, MpmcReceiver<T>) {
        let (tx, rx) = cbchan::unbounded::<T>();
        (MpmcSender { tx }, MpmcReceiver { rx })
    }
}

pub struct MpmcSender<E> {
    tx: cbchan::Sender<E>,
}

impl<E> Clone for MpmcSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: Send + 'static> BaseTx for MpmcSender<E> {
    type EventType = E;

    #[inline]
    fn try_send(&mut self, a: E) -> Result<(), SendError<E>> {
        match self.tx.try_send(a) {
            Ok(()) => Ok(()),
            Err(cbchan::TrySendError::Full(v)) => Err(SendError::full(Some(v))),
            Err(cbchan::TrySendError::Disconnected(v)) => Err(SendError::closed(Some(v))),
        }
    }

    fn send(
        &mut self,
        mut a: E,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<(), SendError<E>> {
        let start = Instant::now();
        let mut idle = IdleBackoff::new();

        loop {
            if cancel.is_cancelled() {
                return Err(SendError::cancelled(Some(a)));
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(SendError::timeout(Some(a)));
            }

            match self.tx.try_send(a) {
                Ok(()) => return Ok(()),
                Err(cbchan::TrySendError::Full(v)) => {
                    a = v;
                    idle.idle();
                }
                Err(cbchan::TrySendError::Disconnected(v)) => {
                    return Err(SendError::closed(Some(v)));
                }
            }
        }
    }
}

pub struct MpmcReceiver<E> {
    rx: cbchan::Receiver<E>,
}

impl<E> Clone for MpmcReceiver<E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<E: Send + 'static> BaseRx for MpmcReceiver<E> {
    type EventType = E;

    #[inline]
    fn try_recv(&mut self) -> Result<E, TryRecvError> {
        match self.rx.try_recv() {
            Ok(v) => Ok(v),
            Err(cbchan::TryRecvError::Empty) => Err(TryRecvError::Empty),
            Err(cbchan::TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }

    /// Parks on the channel in short slices so cancellation is noticed
    /// without spinning.
    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<E, RecvError> {
        const SLICE: Duration = Duration::from_millis(5);
        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let wait = match timeout {
                Some(t) => {
                    let left = t.saturating_sub(start.elapsed());
                    if left.is_zero() {
                        return Err(RecvError::Timeout);
                    }
                    left.min(SLICE)
                }
                None => SLICE,
            };

            match self.rx.recv_timeout(wait) {
                Ok(v) => return Ok(v),
                Err(cbchan::RecvTimeoutError::Timeout) => continue,
                Err(cbchan::RecvTimeoutError::Disconnected) => {
                    return Err(RecvError::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendFailReason;

    #[test]
    fn recv_times_out_on_empty_channel() {
        let (_tx, mut rx) = MpmcChannel::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        let err = rx
            .recv(&cancel, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, RecvError::Timeout));
    }

    #[test]
    fn recv_reports_disconnect() {
        let (tx, mut rx) = MpmcChannel::unbounded::<u32>();
        drop(tx);
        let cancel = CancelToken::new_root();
        assert!(matches!(
            rx.recv(&cancel, None).unwrap_err(),
            RecvError::Disconnected
        ));
    }

    #[test]
    fn full_channel_hands_value_back() {
        let (mut tx, _rx) = MpmcChannel::bounded::<u32>(1);
        tx.try_send(1).unwrap();
        let err = tx.try_send(2).unwrap_err();
        assert_eq!(err.value, Some(2));
    }

    #[test]
    fn blocking_send_honours_timeout_and_cancel() {
        let (mut tx, mut rx) = MpmcChannel::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        tx.send(1, &cancel, None).unwrap();

        let err = tx.send(2, &cancel, Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err.reason, SendFailReason::Timeout);
        assert_eq!(rx.try_recv().unwrap(), 1);

        cancel.cancel();
        let err = tx.send(3, &cancel, None).unwrap_err();
        assert_eq!(err.reason, SendFailReason::Cancelled);
        assert_eq!(err.value, Some(3));
    }
}
