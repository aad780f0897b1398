use crate::error::{RecvError, SendError, TryRecvError};
use crate::io::IdleBackoff;
use crate::io::base::{BaseRx, BaseTx};
use crate::utils::CancelToken;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::time::{Duration, Instant};

/// Single-producer single-consumer ring; carries controller commands.
pub struct RingBuffer;

impl RingBuffer {
    pub fn bounded<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
        let rb = HeapRb::<T>::new(capacity.max(1));
        let (prod, cons) = rb.split();

        (RingSender { prod }, RingReceiver { cons })
    }
}

pub struct RingSender<E> {
    prod: HeapProd<E>,
}

impl<E: Send + 'static> BaseTx for RingSender<E> {
    type EventType = E;

    #[inline]
    fn try_send(&mut self, a: E) -> Result<(), SendError<E>> {
        self.prod.try_push(a).map_err(|v| SendError::full(Some(v)))
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

            match self.prod.try_push(a) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    a = back;
                    idle.idle();
                }
            }
        }
    }
}

pub struct RingReceiver<E> {
    cons: HeapCons<E>,
}

impl<E: Send + 'static> BaseRx for RingReceiver<E> {
    type EventType = E;

    #[inline]
    fn try_recv(&mut self) -> Result<E, TryRecvError> {
        self.cons.try_pop().ok_or(TryRecvError::Empty)
    }

    fn recv(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<E, RecvError> {
        let start = Instant::now();
        let mut idle = IdleBackoff::new();

        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(RecvError::Timeout);
            }

            match self.cons.try_pop() {
                Some(a) => return Ok(a),
                None => idle.idle(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SendFailReason;
    use std::thread;

    #[test]
    fn send_waits_for_room() {
        let (mut tx, mut rx) = RingBuffer::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        tx.try_send(1).unwrap();

        let err = tx.send(2, &cancel, Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err.reason, SendFailReason::Timeout);
        assert_eq!(err.value, Some(2));

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let first = rx.try_recv().unwrap();
            (first, rx)
        });
        tx.send(3, &cancel, Some(Duration::from_secs(2))).unwrap();
        let (first, mut rx) = consumer.join().unwrap();
        assert_eq!(first, 1);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn send_gives_up_when_cancelled() {
        let (mut tx, _rx) = RingBuffer::bounded::<u32>(1);
        let cancel = CancelToken::new_root();
        tx.try_send(1).unwrap();
        cancel.cancel();
        let err = tx.send(2, &cancel, None).unwrap_err();
        assert_eq!(err.reason, SendFailReason::Cancelled);
    }
}
