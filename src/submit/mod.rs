//! Per-queue batching of recorded command buffers.
//!
//! Packets appended during a frame are gathered into one native submission
//! per queue at the frame boundary. Completion is detected by polling the
//! timeline counters each batch signals; nothing here ever blocks on the GPU.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use ash::vk;
use futures::channel::oneshot;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::{Backend, NativeSubmission, QueueType, SignalEntry, WaitEntry};
use crate::sync::{RecordingContext, Stage};

/// A timeline semaphore and the last value scheduled to be signalled on it.
pub struct TimelineCounter<B: Backend> {
    backend: Arc<B>,
    semaphore: vk::Semaphore,
    last: AtomicU64,
}

impl<B: Backend> TimelineCounter<B> {
    pub fn new(backend: Arc<B>) -> Result<Self> {
        let semaphore = backend.create_timeline(0)?;
        Ok(Self {
            backend,
            semaphore,
            last: AtomicU64::new(0),
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn last_scheduled(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Value the device has reached so far.
    pub fn completed(&self) -> Result<u64> {
        self.backend.timeline_value(self.semaphore)
    }

    /// Wait on the most recently scheduled value before `stages` run.
    pub fn wait_entry(&self, stages: Stage) -> WaitEntry {
        WaitEntry {
            semaphore: self.semaphore,
            value: self.last_scheduled(),
            stages,
        }
    }

    fn next_value(&self) -> u64 {
        self.last.load(Ordering::Acquire) + 1
    }

    fn commit(&self, value: u64) {
        self.last.fetch_max(value, Ordering::AcqRel);
    }
}

impl<B: Backend> Drop for TimelineCounter<B> {
    fn drop(&mut self) {
        self.backend.destroy_timeline(self.semaphore);
    }
}

/// Anything the device reads from while a batch executes.
type KeepAlive = Box<dyn Send>;

struct PendingSubmissionPacket<B: Backend> {
    cmd: vk::CommandBuffer,
    counter: Arc<TimelineCounter<B>>,
    waits: SmallVec<[WaitEntry; 2]>,
    sender: oneshot::Sender<Result<()>>,
    keep_alive: Option<KeepAlive>,
}

struct ExecutingBatch<B: Backend> {
    command_buffers: Vec<vk::CommandBuffer>,
    targets: SmallVec<[(Arc<TimelineCounter<B>>, u64); 2]>,
    continuations: Vec<oneshot::Sender<Result<()>>>,
    // Released only after `targets` are reached, whatever happened to the
    // futures waiting on `continuations`.
    keep_alive: Vec<KeepAlive>,
}

impl<B: Backend> ExecutingBatch<B> {
    fn is_complete(&self) -> Result<bool> {
        for (counter, value) in &self.targets {
            if counter.completed()? < *value {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

struct QueueState<B: Backend> {
    pending: Vec<PendingSubmissionPacket<B>>,
    executing: VecDeque<ExecutingBatch<B>>,
}

impl<B: Backend> Default for QueueState<B> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            executing: VecDeque::new(),
        }
    }
}

pub struct SubmissionBatcher<B: Backend> {
    backend: Arc<B>,
    recording: Arc<RecordingContext<B>>,
    queues: [Mutex<QueueState<B>>; 3],
}

impl<B: Backend> SubmissionBatcher<B> {
    pub fn new(backend: Arc<B>, recording: Arc<RecordingContext<B>>) -> Self {
        Self {
            backend,
            recording,
            queues: Default::default(),
        }
    }

    /// Queues `cmd` for the next [`SubmissionBatcher::submit_pending`] on
    /// `queue`. The returned future resolves once the batch holding it has
    /// completed on the device.
    pub fn append_submission(
        &self,
        queue: QueueType,
        cmd: vk::CommandBuffer,
        counter: &Arc<TimelineCounter<B>>,
        waits: &[WaitEntry],
    ) -> Completion {
        self.push_packet(queue, cmd, counter, waits, None)
    }

    /// Like [`SubmissionBatcher::append_submission`], but `keep_alive` is
    /// owned by the batch and dropped only once the device has finished it.
    /// Use it for staging memory `cmd` reads from, so that dropping the
    /// returned [`Completion`] cannot free it early.
    pub fn append_submission_with<K: Send + 'static>(
        &self,
        queue: QueueType,
        cmd: vk::CommandBuffer,
        counter: &Arc<TimelineCounter<B>>,
        waits: &[WaitEntry],
        keep_alive: K,
    ) -> Completion {
        self.push_packet(queue, cmd, counter, waits, Some(Box::new(keep_alive)))
    }

    fn push_packet(
        &self,
        queue: QueueType,
        cmd: vk::CommandBuffer,
        counter: &Arc<TimelineCounter<B>>,
        waits: &[WaitEntry],
        keep_alive: Option<KeepAlive>,
    ) -> Completion {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.queues[queue.index()].lock();
        state.pending.push(PendingSubmissionPacket {
            cmd,
            counter: counter.clone(),
            waits: waits.iter().copied().collect(),
            sender,
            keep_alive,
        });
        log::trace!(
            "appended {:?} to {:?} ({} pending)",
            cmd,
            queue,
            state.pending.len()
        );
        Completion { receiver }
    }

    /// Sends everything appended on `queue` as one native submission.
    /// Returns the number of packets submitted.
    pub fn submit_pending(&self, queue: QueueType) -> Result<usize> {
        let mut state = self.queues[queue.index()].lock();
        if state.pending.is_empty() {
            return Ok(0);
        }
        let packets = std::mem::take(&mut state.pending);

        let mut targets: SmallVec<[(Arc<TimelineCounter<B>>, u64); 2]> = SmallVec::new();
        let mut submission = NativeSubmission::default();
        for packet in &packets {
            submission.command_buffers.push(packet.cmd);
            if !targets.iter().any(|(c, _)| Arc::ptr_eq(c, &packet.counter)) {
                let value = packet.counter.next_value();
                submission.signals.push(SignalEntry {
                    semaphore: packet.counter.semaphore(),
                    value,
                });
                targets.push((packet.counter.clone(), value));
            }
            for wait in &packet.waits {
                match submission
                    .waits
                    .iter_mut()
                    .find(|w| w.semaphore == wait.semaphore)
                {
                    Some(existing) => {
                        existing.value = existing.value.max(wait.value);
                        existing.stages |= wait.stages;
                    }
                    None => submission.waits.push(*wait),
                }
            }
        }

        if let Err(err) = self.backend.submit(queue, &submission) {
            log::warn!(
                "submission of {} command buffers on {:?} failed: {}",
                packets.len(),
                queue,
                err
            );
            // Nothing reached the device, so the packets' memory can go too.
            for packet in packets {
                let _ = packet.sender.send(Err(err.clone()));
                self.recording.retire(queue, packet.cmd);
            }
            return Err(err);
        }

        for (counter, value) in &targets {
            counter.commit(*value);
        }
        let count = packets.len();
        log::debug!(
            "submitted batch of {} on {:?}, signalling {:?}",
            count,
            queue,
            submission.signals
        );
        let mut continuations = Vec::with_capacity(count);
        let mut keep_alive = Vec::new();
        for packet in packets {
            continuations.push(packet.sender);
            keep_alive.extend(packet.keep_alive);
        }
        state.executing.push_back(ExecutingBatch {
            command_buffers: submission.command_buffers,
            targets,
            continuations,
            keep_alive,
        });
        Ok(count)
    }

    /// Resolves every batch whose counters have all been reached. Returns
    /// the number of batches retired.
    ///
    /// A batch whose counter cannot be queried is failed with that error
    /// and retired as well. Every queue is still visited; the first such
    /// error is returned once all finished batches have been resolved.
    pub fn poll_completions(&self) -> Result<usize> {
        let mut done = Vec::new();
        let mut first_err = None;
        for queue in QueueType::ALL {
            let mut state = self.queues[queue.index()].lock();
            let mut i = 0;
            while i < state.executing.len() {
                let outcome = match state.executing[i].is_complete() {
                    Ok(false) => {
                        i += 1;
                        continue;
                    }
                    Ok(true) => Ok(()),
                    Err(err) => {
                        log::error!("querying a {:?} batch failed: {}", queue, err);
                        first_err.get_or_insert_with(|| err.clone());
                        Err(err)
                    }
                };
                if let Some(batch) = state.executing.remove(i) {
                    done.push((queue, batch, outcome));
                }
            }
        }

        let count = done.len();
        for (queue, batch, outcome) in done {
            log::debug!(
                "batch of {} on {:?} finished: {:?}",
                batch.command_buffers.len(),
                queue,
                outcome
            );
            drop(batch.keep_alive);
            for sender in batch.continuations {
                let _ = sender.send(outcome.clone());
            }
            for cmd in batch.command_buffers {
                self.recording.retire(queue, cmd);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    pub fn pending_count(&self, queue: QueueType) -> usize {
        self.queues[queue.index()].lock().pending.len()
    }

    /// Batches submitted but not yet observed complete, across all queues.
    pub fn in_flight_count(&self) -> usize {
        self.queues.iter().map(|q| q.lock().executing.len()).sum()
    }
}

impl<B: Backend> Drop for SubmissionBatcher<B> {
    fn drop(&mut self) {
        let in_flight = self.in_flight_count();
        if in_flight > 0 {
            log::warn!("dropping batcher with {} batches in flight", in_flight);
        }
    }
}

/// Resolves when the batch a packet was submitted in has completed.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion {
    receiver: oneshot::Receiver<Result<()>>,
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(GPUError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{NullBackend, NullConfig};
    use futures::FutureExt;

    fn setup() -> (Arc<NullBackend>, Arc<RecordingContext<NullBackend>>, SubmissionBatcher<NullBackend>) {
        let backend = Arc::new(NullBackend::new(NullConfig {
            auto_complete: false,
            ..Default::default()
        }));
        let recording = Arc::new(RecordingContext::new(backend.clone()).unwrap());
        let batcher = SubmissionBatcher::new(backend.clone(), recording.clone());
        (backend, recording, batcher)
    }

    #[test]
    fn shared_counter_is_signalled_once_per_batch() {
        let (backend, recording, batcher) = setup();
        let counter = Arc::new(TimelineCounter::new(backend.clone()).unwrap());
        let mut token = recording.try_acquire().unwrap();
        let a = token.record(QueueType::Transfer, "a", &[]).unwrap();
        let b = token.record(QueueType::Transfer, "b", &[]).unwrap();
        drop(token);

        let mut first = batcher.append_submission(QueueType::Transfer, a, &counter, &[]);
        let mut second = batcher.append_submission(QueueType::Transfer, b, &counter, &[]);
        assert_eq!(batcher.pending_count(QueueType::Transfer), 2);
        assert_eq!(batcher.submit_pending(QueueType::Transfer).unwrap(), 2);
        assert_eq!(batcher.submit_pending(QueueType::Transfer).unwrap(), 0);

        let signals = backend.unsignaled();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].value, 1);
        assert_eq!(counter.last_scheduled(), 1);
        assert_eq!(counter.wait_entry(Stage::TRANSFER).value, 1);

        assert_eq!(batcher.poll_completions().unwrap(), 0);
        assert!((&mut first).now_or_never().is_none());

        backend.signal(counter.semaphore(), 1);
        assert_eq!(batcher.poll_completions().unwrap(), 1);
        assert_eq!(first.now_or_never(), Some(Ok(())));
        assert_eq!(second.now_or_never(), Some(Ok(())));
        assert_eq!(recording.retired_count(), 2);
        assert_eq!(batcher.in_flight_count(), 0);
    }

    #[test]
    fn native_failure_reaches_every_packet() {
        let (backend, recording, batcher) = setup();
        let counter = Arc::new(TimelineCounter::new(backend.clone()).unwrap());
        let mut token = recording.try_acquire().unwrap();
        let a = token.record(QueueType::Graphics, "a", &[]).unwrap();
        let b = token.record(QueueType::Graphics, "b", &[]).unwrap();
        drop(token);

        let first = batcher.append_submission(QueueType::Graphics, a, &counter, &[]);
        let second = batcher.append_submission(QueueType::Graphics, b, &counter, &[]);
        backend.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert!(batcher.submit_pending(QueueType::Graphics).is_err());

        for completion in [first, second] {
            match completion.now_or_never() {
                Some(Err(GPUError::Vulkan(e))) => {
                    assert_eq!(e.result(), vk::Result::ERROR_DEVICE_LOST)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(counter.last_scheduled(), 0);
        assert_eq!(batcher.in_flight_count(), 0);
    }

    #[test]
    fn keep_alive_outlives_a_dropped_completion() {
        struct Flag(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (backend, recording, batcher) = setup();
        let counter = Arc::new(TimelineCounter::new(backend.clone()).unwrap());
        let mut token = recording.try_acquire().unwrap();
        let cmd = token.record(QueueType::Transfer, "copy", &[]).unwrap();
        drop(token);

        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let completion = batcher.append_submission_with(
            QueueType::Transfer,
            cmd,
            &counter,
            &[],
            Flag(released.clone()),
        );
        batcher.submit_pending(QueueType::Transfer).unwrap();
        drop(completion);
        assert_eq!(batcher.poll_completions().unwrap(), 0);
        assert!(!released.load(Ordering::SeqCst));

        backend.signal(counter.semaphore(), 1);
        assert_eq!(batcher.poll_completions().unwrap(), 1);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_batcher_abandons_completions() {
        let (backend, _recording, batcher) = setup();
        let counter = Arc::new(TimelineCounter::new(backend.clone()).unwrap());
        let completion =
            batcher.append_submission(QueueType::Compute, vk::CommandBuffer::null(), &counter, &[]);
        drop(batcher);
        assert_eq!(completion.now_or_never(), Some(Err(GPUError::Abandoned)));
    }
}
