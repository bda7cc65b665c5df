use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use crossbeam_queue::SegQueue;
use futures::lock::{Mutex, MutexGuard};

use crate::gpu::error::Result;
use crate::gpu::{Backend, QueueType};
use crate::sync::TransferStep;

/// The single context all transfer command buffers are recorded in.
///
/// Recording needs a [`RecordingToken`], obtained by awaiting
/// [`RecordingContext::acquire`]. Only one token exists at a time, so the
/// recorder is never used from two places at once regardless of which
/// thread holds the token.
pub struct RecordingContext<B: Backend> {
    backend: Arc<B>,
    recorder: Mutex<ManuallyDrop<B::Recorder>>,
    retired: SegQueue<(QueueType, vk::CommandBuffer)>,
}

impl<B: Backend> RecordingContext<B> {
    pub fn new(backend: Arc<B>) -> Result<Self> {
        let recorder = backend.create_recorder()?;
        Ok(Self {
            backend,
            recorder: Mutex::new(ManuallyDrop::new(recorder)),
            retired: SegQueue::new(),
        })
    }

    /// Waits for exclusive use of the recorder.
    pub async fn acquire(&self) -> RecordingToken<'_, B> {
        let guard = self.recorder.lock().await;
        self.token(guard)
    }

    pub fn try_acquire(&self) -> Option<RecordingToken<'_, B>> {
        self.recorder.try_lock().map(|guard| self.token(guard))
    }

    /// Hands back a command buffer whose execution finished. It is recycled
    /// the next time a token is taken.
    pub fn retire(&self, queue: QueueType, cmd: vk::CommandBuffer) {
        self.retired.push((queue, cmd));
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn token<'a>(&'a self, mut guard: MutexGuard<'a, ManuallyDrop<B::Recorder>>) -> RecordingToken<'a, B> {
        while let Some((queue, cmd)) = self.retired.pop() {
            self.backend.recycle(&mut guard, queue, cmd);
        }
        RecordingToken {
            backend: &self.backend,
            guard,
        }
    }
}

impl<B: Backend> Drop for RecordingContext<B> {
    fn drop(&mut self) {
        // SAFETY: the recorder is not used after this.
        let recorder = unsafe { ManuallyDrop::take(self.recorder.get_mut()) };
        self.backend.destroy_recorder(recorder);
    }
}

/// Proof of exclusive access to the recording context.
pub struct RecordingToken<'a, B: Backend> {
    backend: &'a B,
    guard: MutexGuard<'a, ManuallyDrop<B::Recorder>>,
}

impl<'a, B: Backend> RecordingToken<'a, B> {
    pub fn record(
        &mut self,
        queue: QueueType,
        debug_name: &str,
        steps: &[TransferStep],
    ) -> Result<vk::CommandBuffer> {
        let cmd = self
            .backend
            .record(&mut self.guard, queue, debug_name, steps)?;
        log::trace!(
            "recorded '{}' on {:?} ({} steps)",
            debug_name,
            queue,
            steps.len()
        );
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::NullBackend;
    use futures::executor::block_on;

    #[test]
    fn only_one_token_at_a_time() {
        let ctx = RecordingContext::new(Arc::new(NullBackend::default())).unwrap();
        let mut token = block_on(ctx.acquire());
        assert!(ctx.try_acquire().is_none());
        let cmd = token.record(QueueType::Transfer, "empty", &[]).unwrap();
        drop(token);

        ctx.retire(QueueType::Transfer, cmd);
        assert_eq!(ctx.retired_count(), 1);
        let mut token = ctx.try_acquire().unwrap();
        assert_eq!(ctx.retired_count(), 0);
        // The retired buffer is handed out again.
        assert_eq!(token.record(QueueType::Transfer, "again", &[]).unwrap(), cmd);
    }
}
