//! Host-memory backend with no device behind it.
//!
//! Every buffer and image is backed by plain host memory, copies are carried
//! out when a submission reaches a queue, and timeline semaphores only move
//! when [`NullBackend::signal`] is called (or immediately on submit with
//! `auto_complete`). Every recording, submission and signal is appended to an
//! event log with a global sequence number, so callers can check the order in
//! which things happened.

use std::collections::HashMap;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use super::error::{GPUError, Result};
use super::{
    Backend, BufferInfo, DeviceLimits, ImageInfo, MappedPtr, NativeSubmission, QueueType,
    RawBuffer, RawImage, SignalEntry, WaitEntry,
};
use crate::sync::TransferStep;

#[derive(Debug, Clone)]
pub struct NullConfig {
    pub limits: DeviceLimits,
    /// Family index reported for graphics, compute and transfer queues.
    pub families: [u32; 3],
    /// Signal every timeline value as soon as it is submitted.
    pub auto_complete: bool,
    /// Total bytes of memory the fake device has.
    pub budget: Option<u64>,
}

impl Default for NullConfig {
    fn default() -> Self {
        Self {
            limits: DeviceLimits::default(),
            families: [0, 1, 2],
            auto_complete: true,
            budget: None,
        }
    }
}

impl NullConfig {
    /// Every queue type reports the same family.
    pub fn single_family() -> Self {
        Self {
            families: [0, 0, 0],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NullEvent {
    Recorded {
        seq: u64,
        queue: QueueType,
        cmd: vk::CommandBuffer,
        steps: Vec<TransferStep>,
    },
    Submitted {
        seq: u64,
        queue: QueueType,
        command_buffers: Vec<vk::CommandBuffer>,
        waits: Vec<WaitEntry>,
        signals: Vec<SignalEntry>,
    },
    Signaled {
        seq: u64,
        semaphore: vk::Semaphore,
        value: u64,
    },
}

impl NullEvent {
    pub fn seq(&self) -> u64 {
        match self {
            NullEvent::Recorded { seq, .. }
            | NullEvent::Submitted { seq, .. }
            | NullEvent::Signaled { seq, .. } => *seq,
        }
    }
}

#[derive(Debug)]
pub struct NullMemory {
    bytes: u64,
}

#[derive(Debug, Default)]
pub struct NullRecorder {
    free: [Vec<vk::CommandBuffer>; 3],
}

struct ImageStore {
    info: ImageInfo<'static>,
    bytes: Box<[u8]>,
}

#[derive(Default)]
struct NullState {
    next_handle: u64,
    seq: u64,
    used: u64,
    buffers: HashMap<vk::Buffer, Box<[u8]>>,
    images: HashMap<vk::Image, ImageStore>,
    recordings: HashMap<vk::CommandBuffer, Vec<TransferStep>>,
    timelines: HashMap<vk::Semaphore, u64>,
    unsignaled: Vec<SignalEntry>,
    events: Vec<NullEvent>,
    submit_failure: Option<vk::Result>,
    query_failures: HashMap<vk::Semaphore, vk::Result>,
}

impl NullState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn reserve(&mut self, budget: Option<u64>, bytes: u64) -> Result<()> {
        if let Some(budget) = budget {
            if self.used + bytes > budget {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
            }
        }
        self.used += bytes;
        Ok(())
    }

    fn signal(&mut self, semaphore: vk::Semaphore, value: u64) {
        let Some(current) = self.timelines.get_mut(&semaphore) else {
            return;
        };
        if value <= *current {
            return;
        }
        *current = value;
        self.unsignaled
            .retain(|s| !(s.semaphore == semaphore && s.value <= value));
        let seq = self.next_seq();
        self.events.push(NullEvent::Signaled {
            seq,
            semaphore,
            value,
        });
    }

    fn execute(&mut self, step: &TransferStep) -> Result<()> {
        match *step {
            TransferStep::Barrier(_) => Ok(()),
            TransferStep::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let data = self.read_buffer(src, src_offset, size)?;
                let target = self
                    .buffers
                    .get_mut(&dst)
                    .ok_or_else(|| GPUError::invalid("copy into unknown buffer"))?;
                let range = byte_range(dst_offset, size, target.len())?;
                target[range].copy_from_slice(&data);
                Ok(())
            }
            TransferStep::CopyBufferToImage {
                src,
                src_offset,
                image,
                extent,
                mip_level,
                base_layer,
                layer_count,
                ..
            } => {
                let store = self
                    .images
                    .get(&image)
                    .ok_or_else(|| GPUError::invalid("copy into unknown image"))?;
                let texel = store.info.format.bytes_per_texel();
                let region = extent.iter().map(|d| *d as u64).product::<u64>() * texel;
                let layer_size = ImageInfo {
                    layers: 1,
                    ..store.info
                }
                .byte_size();
                let mip_offset = ImageInfo {
                    layers: 1,
                    mip_levels: mip_level,
                    ..store.info
                };
                let mip_offset = if mip_level == 0 { 0 } else { mip_offset.byte_size() };
                let data = self.read_buffer(src, src_offset, region * layer_count as u64)?;
                let store = self
                    .images
                    .get_mut(&image)
                    .ok_or_else(|| GPUError::invalid("copy into unknown image"))?;
                for layer in 0..layer_count as u64 {
                    let start = (base_layer as u64 + layer) * layer_size + mip_offset;
                    let range = byte_range(start, region, store.bytes.len())?;
                    let chunk = (layer * region) as usize..((layer + 1) * region) as usize;
                    store.bytes[range].copy_from_slice(&data[chunk]);
                }
                Ok(())
            }
        }
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, size: u64) -> Result<Vec<u8>> {
        let source = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| GPUError::invalid("copy from unknown buffer"))?;
        let range = byte_range(offset, size, source.len())?;
        Ok(source[range].to_vec())
    }
}

fn byte_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(size)
        .filter(|end| *end <= len as u64)
        .ok_or_else(|| GPUError::invalid("copy range out of bounds"))?;
    Ok(offset as usize..end as usize)
}

/// A [`Backend`] that needs no GPU.
pub struct NullBackend {
    config: NullConfig,
    state: Mutex<NullState>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new(NullConfig::default())
    }
}

impl NullBackend {
    pub fn new(config: NullConfig) -> Self {
        Self {
            config,
            state: Mutex::new(NullState::default()),
        }
    }

    pub fn config(&self) -> &NullConfig {
        &self.config
    }

    /// Advances `semaphore` to `value`. Lower values are ignored.
    pub fn signal(&self, semaphore: vk::Semaphore, value: u64) {
        self.state.lock().signal(semaphore, value);
    }

    /// Signals every submitted value that has not been signalled yet, in
    /// submission order.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.unsignaled);
        let count = pending.len();
        for entry in pending {
            state.signal(entry.semaphore, entry.value);
        }
        count
    }

    /// Values submitted for signalling that have not been reached yet.
    pub fn unsignaled(&self) -> Vec<SignalEntry> {
        self.state.lock().unsignaled.clone()
    }

    /// Makes the next [`Backend::submit`] fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().submit_failure = Some(result);
    }

    /// Makes every query of `semaphore` fail with `result` from now on.
    pub fn fail_timeline_queries(&self, semaphore: vk::Semaphore, result: vk::Result) {
        self.state.lock().query_failures.insert(semaphore, result);
    }

    pub fn events(&self) -> Vec<NullEvent> {
        self.state.lock().events.clone()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.to_vec())
    }

    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state.lock().images.get(&image).map(|i| i.bytes.to_vec())
    }

    pub fn recorded_steps(&self, cmd: vk::CommandBuffer) -> Option<Vec<TransferStep>> {
        self.state.lock().recordings.get(&cmd).cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn memory_in_use(&self) -> u64 {
        self.state.lock().used
    }
}

impl Backend for NullBackend {
    type Memory = NullMemory;
    type Recorder = NullRecorder;

    fn queue_family(&self, queue: QueueType) -> u32 {
        self.config.families[queue.index()]
    }

    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }

    fn create_buffer(&self, info: &BufferInfo) -> Result<RawBuffer<NullMemory>> {
        let mut state = self.state.lock();
        state.reserve(self.config.budget, info.byte_size)?;
        let buffer = vk::Buffer::from_raw(state.handle());
        let mut bytes = vec![0u8; info.byte_size as usize].into_boxed_slice();
        // Boxed storage never moves, so the pointer stays valid until destroy.
        let mapped = if info.preset.host_visible() {
            MappedPtr::new(bytes.as_mut_ptr())
        } else {
            None
        };
        state.buffers.insert(buffer, bytes);
        Ok(RawBuffer {
            buffer,
            memory: NullMemory {
                bytes: info.byte_size,
            },
            mapped,
        })
    }

    fn create_image(&self, info: &ImageInfo) -> Result<RawImage<NullMemory>> {
        let bytes = info.byte_size();
        let mut state = self.state.lock();
        state.reserve(self.config.budget, bytes)?;
        let image = vk::Image::from_raw(state.handle());
        state.images.insert(
            image,
            ImageStore {
                info: ImageInfo {
                    debug_name: "",
                    dim: info.dim,
                    layers: info.layers,
                    format: info.format,
                    mip_levels: info.mip_levels,
                    preset: info.preset,
                },
                bytes: vec![0u8; bytes as usize].into_boxed_slice(),
            },
        );
        Ok(RawImage {
            image,
            memory: NullMemory { bytes },
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: NullMemory) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.used -= memory.bytes;
    }

    fn destroy_image(&self, image: vk::Image, memory: NullMemory) {
        let mut state = self.state.lock();
        state.images.remove(&image);
        state.used -= memory.bytes;
    }

    fn flush(&self, _memory: &NullMemory, _offset: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    fn create_recorder(&self) -> Result<NullRecorder> {
        Ok(NullRecorder::default())
    }

    fn record(
        &self,
        recorder: &mut NullRecorder,
        queue: QueueType,
        _debug_name: &str,
        steps: &[TransferStep],
    ) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let cmd = match recorder.free[queue.index()].pop() {
            Some(cmd) => cmd,
            None => vk::CommandBuffer::from_raw(state.handle()),
        };
        state.recordings.insert(cmd, steps.to_vec());
        let seq = state.next_seq();
        state.events.push(NullEvent::Recorded {
            seq,
            queue,
            cmd,
            steps: steps.to_vec(),
        });
        Ok(cmd)
    }

    fn recycle(&self, recorder: &mut NullRecorder, queue: QueueType, cmd: vk::CommandBuffer) {
        self.state.lock().recordings.remove(&cmd);
        recorder.free[queue.index()].push(cmd);
    }

    fn destroy_recorder(&self, _recorder: NullRecorder) {}

    fn create_timeline(&self, initial: u64) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.timelines.insert(semaphore, initial);
        Ok(semaphore)
    }

    fn destroy_timeline(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.timelines.remove(&semaphore);
        state.unsignaled.retain(|s| s.semaphore != semaphore);
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        let state = self.state.lock();
        if let Some(res) = state.query_failures.get(&semaphore) {
            return Err((*res).into());
        }
        state
            .timelines
            .get(&semaphore)
            .copied()
            .ok_or_else(|| GPUError::invalid("unknown timeline semaphore"))
    }

    fn submit(&self, queue: QueueType, submission: &NativeSubmission) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(res) = state.submit_failure.take() {
            return Err(res.into());
        }

        for cmd in &submission.command_buffers {
            let steps = state
                .recordings
                .get(cmd)
                .cloned()
                .ok_or_else(|| GPUError::invalid("submitted command buffer was never recorded"))?;
            for step in &steps {
                state.execute(step)?;
            }
        }

        let seq = state.next_seq();
        state.events.push(NullEvent::Submitted {
            seq,
            queue,
            command_buffers: submission.command_buffers.clone(),
            waits: submission.waits.clone(),
            signals: submission.signals.clone(),
        });

        if self.config.auto_complete {
            for signal in &submission.signals {
                state.signal(signal.semaphore, signal.value);
            }
        } else {
            state.unsignaled.extend(submission.signals.iter().copied());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BufferPreset;
    use crate::sync::TransferStep;

    #[test]
    fn copies_run_on_submit_and_signals_wait_for_the_caller() {
        let backend = NullBackend::new(NullConfig {
            auto_complete: false,
            ..Default::default()
        });
        let src = backend
            .create_buffer(&BufferInfo {
                byte_size: 8,
                preset: BufferPreset::Staging,
                ..Default::default()
            })
            .unwrap();
        let dst = backend
            .create_buffer(&BufferInfo {
                byte_size: 8,
                ..Default::default()
            })
            .unwrap();
        assert!(dst.mapped.is_none());
        unsafe {
            std::ptr::copy_nonoverlapping([9u8, 8, 7].as_ptr(), src.mapped.unwrap().as_ptr(), 3)
        };

        let mut recorder = backend.create_recorder().unwrap();
        let cmd = backend
            .record(
                &mut recorder,
                QueueType::Transfer,
                "copy",
                &[TransferStep::CopyBuffer {
                    src: src.buffer,
                    src_offset: 0,
                    dst: dst.buffer,
                    dst_offset: 4,
                    size: 3,
                }],
            )
            .unwrap();
        let sem = backend.create_timeline(0).unwrap();
        backend
            .submit(
                QueueType::Transfer,
                &NativeSubmission {
                    command_buffers: vec![cmd],
                    waits: Vec::new(),
                    signals: vec![SignalEntry {
                        semaphore: sem,
                        value: 1,
                    }],
                },
            )
            .unwrap();

        assert_eq!(
            backend.buffer_contents(dst.buffer).unwrap(),
            vec![0, 0, 0, 0, 9, 8, 7, 0]
        );
        assert_eq!(backend.timeline_value(sem).unwrap(), 0);
        assert_eq!(backend.complete_all(), 1);
        assert_eq!(backend.timeline_value(sem).unwrap(), 1);

        let seqs: Vec<u64> = backend.events().iter().map(NullEvent::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn budget_exhaustion_reports_out_of_memory() {
        let backend = NullBackend::new(NullConfig {
            budget: Some(100),
            ..Default::default()
        });
        let kept = backend
            .create_buffer(&BufferInfo {
                byte_size: 80,
                ..Default::default()
            })
            .unwrap();
        let err = backend
            .create_buffer(&BufferInfo {
                byte_size: 40,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, GPUError::OutOfMemory { .. }));
        backend.destroy_buffer(kept.buffer, kept.memory);
        assert_eq!(backend.memory_in_use(), 0);
    }
}
