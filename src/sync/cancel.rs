use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::gpu::error::{GPUError, Result};

/// Wakers of pending [`Cancelled`] futures, one slot per future.
#[derive(Default)]
struct Waiters {
    next_key: u64,
    slots: HashMap<u64, Waker>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Waiters>,
}

/// Cooperative cancellation flag shared between a caller and the work it
/// started. Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots = std::mem::take(&mut self.inner.waiters.lock().slots);
        for (_, waker) in slots {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once [`CancelToken::cancel`] was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GPUError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            key: None,
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().slots.len()
    }
}

/// Future returned by [`CancelToken::cancelled`]. Its waker is forgotten
/// when it is dropped.
pub struct Cancelled {
    token: CancelToken,
    key: Option<u64>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(());
        }
        let mut waiters = this.token.inner.waiters.lock();
        // cancel() takes the slots under the same lock, so re-checking here cannot miss it
        if this.token.is_cancelled() {
            return Poll::Ready(());
        }
        let key = match this.key {
            Some(key) => key,
            None => {
                let key = waiters.next_key;
                waiters.next_key += 1;
                this.key = Some(key);
                key
            }
        };
        match waiters.slots.get_mut(&key) {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            Some(waker) => *waker = cx.waker().clone(),
            None => {
                waiters.slots.insert(key, cx.waker().clone());
            }
        }
        Poll::Pending
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.token.inner.waiters.lock().slots.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::{waker, ArcWake};
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let mut waiting = token.cancelled();
        assert!((&mut waiting).now_or_never().is_none());
        assert!(token.check().is_ok());

        token.clone().cancel();
        assert!(waiting.now_or_never().is_some());
        assert_eq!(token.check(), Err(GPUError::Cancelled));
    }

    #[test]
    fn dropped_waiters_leave_no_wakers_behind() {
        struct Counting(AtomicUsize);
        impl ArcWake for Counting {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let token = CancelToken::new();
        for _ in 0..1000 {
            let waker = waker(Arc::new(Counting(AtomicUsize::new(0))));
            let mut cx = Context::from_waker(&waker);
            let mut waiting = token.cancelled();
            assert!(Pin::new(&mut waiting).poll(&mut cx).is_pending());
            // A second poll with the same waker reuses the slot.
            assert!(Pin::new(&mut waiting).poll(&mut cx).is_pending());
        }
        assert_eq!(token.waiter_count(), 0);

        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let waker = waker(counter.clone());
        let mut kept = token.cancelled();
        assert!(Pin::new(&mut kept).poll(&mut Context::from_waker(&waker)).is_pending());
        assert_eq!(token.waiter_count(), 1);
        token.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(token.waiter_count(), 0);
    }
}
