use std::future::Future;
use std::sync::Arc;

use ash::vk;
use futures::future::{self, Either};
use futures::pin_mut;

use crate::config::TransferConfig;
use crate::gpu::error::{GPUError, Result};
use crate::gpu::{Allocation, Allocator, Backend, Format, ImageInfo, PoolAllocation, QueueType};
use crate::staging::{Region, StagingRing};
use crate::submit::{SubmissionBatcher, TimelineCounter};
use crate::sync::{
    BarrierSequenceBuilder, CancelToken, QueueEndpoint, RecordingContext, ResState,
    ScheduledStep, TransferDescriptor, TransferStep, TransferTarget,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTarget {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        /// Bytes available from `offset` to the end of the buffer.
        capacity: u64,
    },
    Image {
        image: vk::Image,
        extent: [u32; 3],
        format: Format,
        mip_level: u32,
        base_layer: u32,
        layer_count: u32,
    },
}

impl UploadTarget {
    pub fn buffer<B: Backend>(allocation: &Allocation<B>, offset: u64) -> Result<Self> {
        let buffer = allocation
            .buffer()
            .ok_or_else(|| GPUError::invalid("allocation is not a buffer"))?;
        let capacity = allocation
            .byte_size()
            .checked_sub(offset)
            .ok_or_else(|| GPUError::invalid("offset past the end of the buffer"))?;
        Ok(UploadTarget::Buffer {
            buffer,
            offset,
            capacity,
        })
    }

    pub fn pool_range<B: Backend>(range: &PoolAllocation<B>) -> Self {
        UploadTarget::Buffer {
            buffer: range.buffer(),
            offset: range.offset(),
            capacity: range.size(),
        }
    }

    /// Mip 0 of every layer of `allocation`, described by `info`.
    pub fn image<B: Backend>(allocation: &Allocation<B>, info: &ImageInfo) -> Result<Self> {
        let image = allocation
            .image()
            .ok_or_else(|| GPUError::invalid("allocation is not an image"))?;
        Ok(UploadTarget::Image {
            image,
            extent: info.dim,
            format: info.format,
            mip_level: 0,
            base_layer: 0,
            layer_count: info.layers.max(1),
        })
    }

    fn validate(&self, len: u64) -> Result<()> {
        if len == 0 {
            return Err(GPUError::invalid("empty payload"));
        }
        match *self {
            UploadTarget::Buffer { capacity, .. } if len > capacity => Err(GPUError::invalid(
                format!("{} byte payload overflows {} byte destination", len, capacity),
            )),
            UploadTarget::Image {
                extent,
                format,
                layer_count,
                ..
            } => {
                let expected = extent.iter().map(|d| *d as u64).product::<u64>()
                    * format.bytes_per_texel()
                    * layer_count as u64;
                if len != expected {
                    return Err(GPUError::invalid(format!(
                        "{} byte payload does not match {:?} image of {} bytes",
                        len, extent, expected
                    )));
                }
                Ok(())
            }
            UploadTarget::Buffer { .. } => Ok(()),
        }
    }

    /// Read state for the destination queue; a compute-only family must
    /// not see graphics stages in its acquire.
    fn default_consumer(&self, queue: QueueType) -> ResState {
        match self {
            UploadTarget::Buffer { .. } => ResState::buffer_read_on(queue),
            UploadTarget::Image { .. } => ResState::shader_read_on(queue),
        }
    }

    fn transfer_target(&self) -> TransferTarget {
        match *self {
            UploadTarget::Buffer { buffer, offset, .. } => TransferTarget::Buffer { buffer, offset },
            UploadTarget::Image {
                image,
                extent,
                mip_level,
                base_layer,
                layer_count,
                ..
            } => TransferTarget::Image {
                image,
                extent,
                mip_level,
                base_layer,
                layer_count,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Upload<'a> {
    pub bytes: &'a [u8],
    pub destination: UploadTarget,
}

impl<'a> Upload<'a> {
    pub fn new(bytes: &'a [u8], destination: UploadTarget) -> Self {
        Self { bytes, destination }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub source: QueueType,
    pub destination: QueueType,
    pub cancel: Option<CancelToken>,
    /// State the destinations are left in. Defaults to a read on the stages
    /// `destination` can run.
    pub consumer: Option<ResState>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

impl UploadOptions {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            source: config.source_queue,
            destination: config.destination_queue,
            cancel: None,
            consumer: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_queues(mut self, source: QueueType, destination: QueueType) -> Self {
        self.source = source;
        self.destination = destination;
        self
    }
}

/// What one [`TransferOrchestrator::end_frame`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub batches_submitted: usize,
    pub packets_submitted: usize,
    pub batches_completed: usize,
    pub staging_grants: usize,
}

/// Moves CPU payloads into device resources through the staging arena,
/// handing them to the consuming queue when it lives in another family.
pub struct TransferOrchestrator<B: Backend> {
    backend: Arc<B>,
    config: TransferConfig,
    copy_alignment: u64,
    staging: StagingRing<B>,
    recording: Arc<RecordingContext<B>>,
    batcher: SubmissionBatcher<B>,
    counters: [Arc<TimelineCounter<B>>; 3],
}

impl<B: Backend> TransferOrchestrator<B> {
    pub fn new(allocator: &Allocator<B>, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let backend = allocator.backend().clone();
        let copy_alignment = config
            .copy_alignment
            .max(backend.limits().optimal_copy_offset_alignment.max(1));
        // Granted offsets are aligned, so payloads need no slack in front.
        let staging =
            StagingRing::with_granularity(allocator, config.staging_capacity, copy_alignment)?;
        let recording = Arc::new(RecordingContext::new(backend.clone())?);
        let batcher = SubmissionBatcher::new(backend.clone(), recording.clone());
        let counters = [
            Arc::new(TimelineCounter::new(backend.clone())?),
            Arc::new(TimelineCounter::new(backend.clone())?),
            Arc::new(TimelineCounter::new(backend.clone())?),
        ];
        log::debug!(
            "transfer orchestrator ready: {} byte staging, {:?} -> {:?}",
            staging.capacity(),
            config.source_queue,
            config.destination_queue
        );
        Ok(Self {
            backend,
            config,
            copy_alignment,
            staging,
            recording,
            batcher,
            counters,
        })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn staging(&self) -> &StagingRing<B> {
        &self.staging
    }

    pub fn batcher(&self) -> &SubmissionBatcher<B> {
        &self.batcher
    }

    pub fn recording(&self) -> &Arc<RecordingContext<B>> {
        &self.recording
    }

    /// Counter signalled by every batch submitted on `queue`.
    pub fn counter(&self, queue: QueueType) -> &Arc<TimelineCounter<B>> {
        &self.counters[queue.index()]
    }

    /// Stages, copies and hands over `uploads`, resolving once the
    /// destinations are owned by `options.destination`.
    ///
    /// Progress needs [`TransferOrchestrator::end_frame`] to be called
    /// regularly. Cancellation is observed before each wait; work already
    /// appended for submission is always awaited first.
    pub async fn upload(&self, uploads: &[Upload<'_>], options: &UploadOptions) -> Result<()> {
        if uploads.is_empty() {
            return Ok(());
        }
        for upload in uploads {
            upload.destination.validate(upload.bytes.len() as u64)?;
        }
        let cancel = options.cancel.clone().unwrap_or_default();
        cancel.check()?;

        let align = self.copy_alignment;
        let payload: u64 = uploads
            .iter()
            .map(|u| align_up(u.bytes.len() as u64, align))
            .sum();
        let reserve = self.staging.enqueue_allocation(payload);
        let mut region = until_cancelled(&cancel, reserve).await??;

        let base = region.offset();
        let mut cursor = base;
        let mut descriptors = Vec::with_capacity(uploads.len());
        for upload in uploads {
            region.write(cursor - base, upload.bytes)?;
            descriptors.push(TransferDescriptor {
                src: region.buffer(),
                src_offset: cursor,
                size: upload.bytes.len() as u64,
                dst: upload.destination.transfer_target(),
                consumer: options
                    .consumer
                    .unwrap_or_else(|| upload.destination.default_consumer(options.destination)),
            });
            cursor = align_up(cursor + upload.bytes.len() as u64, align);
        }
        region.flush()?;

        let src = QueueEndpoint {
            queue: options.source,
            family: self.backend.queue_family(options.source),
        };
        let dst = QueueEndpoint {
            queue: options.destination,
            family: self.backend.queue_family(options.destination),
        };

        let mut producer: Vec<TransferStep> = Vec::with_capacity(descriptors.len() * 3);
        let mut consumer: Vec<TransferStep> = Vec::new();
        for desc in &descriptors {
            if src.family == dst.family {
                producer.extend(steps_of(&BarrierSequenceBuilder::same_queue(src.queue, desc)));
            } else {
                let transfer = BarrierSequenceBuilder::ownership_transfer(src, dst, desc)?;
                producer.extend(steps_of(transfer.producer()));
                consumer.push(transfer.consumer().step);
            }
        }

        log::debug!(
            "uploading {} payloads ({} bytes) {:?} -> {:?}",
            uploads.len(),
            payload,
            src.queue,
            dst.queue
        );

        // The copy batch owns the region from here, so dropping this future
        // cannot hand its bytes out while the device is still reading them.
        self.run(&cancel, src.queue, "upload copy", &producer, Some(region))
            .await?;

        if !consumer.is_empty() {
            // The release has completed; from here on a cancellation leaves the
            // destination released but never acquired.
            cancel.check()?;
            self.run(&cancel, dst.queue, "upload acquire", &consumer, None)
                .await?;
        }
        Ok(())
    }

    async fn run(
        &self,
        cancel: &CancelToken,
        queue: QueueType,
        name: &str,
        steps: &[TransferStep],
        staged: Option<Region<B>>,
    ) -> Result<()> {
        let label = if self.config.debug_labels { name } else { "" };
        let cmd = {
            let mut token = until_cancelled(cancel, self.recording.acquire()).await?;
            token.record(queue, label, steps)?
        };
        if cancel.is_cancelled() {
            self.recording.retire(queue, cmd);
            return Err(GPUError::Cancelled);
        }
        let counter = self.counter(queue);
        match staged {
            Some(region) => {
                self.batcher
                    .append_submission_with(queue, cmd, counter, &[], region)
                    .await
            }
            None => self.batcher.append_submission(queue, cmd, counter, &[]).await,
        }
    }

    /// Frame boundary: submits everything appended this frame, resolves
    /// finished batches and grants queued staging requests.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned once staging requests have been granted.
    pub fn end_frame(&self) -> Result<FrameReport> {
        let mut report = FrameReport::default();
        let mut first_err = None;
        for queue in QueueType::ALL {
            match self.batcher.submit_pending(queue) {
                Ok(0) => {}
                Ok(packets) => {
                    report.batches_submitted += 1;
                    report.packets_submitted += packets;
                }
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match self.batcher.poll_completions() {
            Ok(completed) => report.batches_completed = completed,
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
        report.staging_grants = self.staging.poll_pending();
        match first_err {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

fn steps_of(steps: &[ScheduledStep]) -> impl Iterator<Item = TransferStep> + '_ {
    steps.iter().map(|s| s.step)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Runs `fut` unless `cancel` fires first.
async fn until_cancelled<F: Future>(cancel: &CancelToken, fut: F) -> Result<F::Output> {
    cancel.check()?;
    pin_mut!(fut);
    match future::select(fut, cancel.cancelled()).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(GPUError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferPreset, NullBackend, NullConfig};
    use futures::executor::block_on;

    fn orchestrator(config: NullConfig) -> (Allocator<NullBackend>, TransferOrchestrator<NullBackend>) {
        let allocator = Allocator::new(Arc::new(NullBackend::new(config)));
        let orch = TransferOrchestrator::new(
            &allocator,
            TransferConfig::default().with_staging_capacity(4096),
        )
        .unwrap();
        (allocator, orch)
    }

    #[test]
    fn empty_upload_list_is_a_no_op() {
        let (_, orch) = orchestrator(NullConfig::default());
        block_on(orch.upload(&[], &UploadOptions::default())).unwrap();
        assert_eq!(orch.end_frame().unwrap(), FrameReport::default());
    }

    #[test]
    fn mismatched_payloads_are_rejected_up_front() {
        let (allocator, orch) = orchestrator(NullConfig::default());
        let info = ImageInfo {
            dim: [2, 2, 1],
            ..Default::default()
        };
        let image = allocator.allocate_image(&info, Default::default()).unwrap();
        let buffer = allocator.allocate_buffer(8, BufferPreset::DeviceLocal).unwrap();

        let too_small = [0u8; 15];
        let err = block_on(orch.upload(
            &[Upload::new(&too_small, UploadTarget::image(&image, &info).unwrap())],
            &UploadOptions::default(),
        ))
        .unwrap_err();
        assert!(matches!(err, GPUError::InvalidArgument { .. }));

        let target = UploadTarget::buffer(&buffer, 4).unwrap();
        for payload in [&[][..], &[1u8; 5][..]] {
            let err = block_on(orch.upload(&[Upload::new(payload, target)], &UploadOptions::default()))
                .unwrap_err();
            assert!(matches!(err, GPUError::InvalidArgument { .. }));
        }
        assert_eq!(orch.staging().stats().granted_total, 0);
    }

    #[test]
    fn same_family_upload_skips_the_acquire() {
        let (allocator, orch) = orchestrator(NullConfig::single_family());
        let buffer = allocator.allocate_buffer(4, BufferPreset::DeviceLocal).unwrap();
        let payload = [1u8, 2, 3, 4];
        let uploads = [Upload::new(&payload, UploadTarget::buffer(&buffer, 0).unwrap())];
        let options = UploadOptions::default();

        let mut upload = Box::pin(orch.upload(&uploads, &options));
        let result = block_on(async {
            loop {
                if let std::task::Poll::Ready(r) = futures::poll!(&mut upload) {
                    break r;
                }
                orch.end_frame().unwrap();
            }
        });
        result.unwrap();

        assert_eq!(
            allocator.backend().buffer_contents(buffer.buffer().unwrap()).unwrap(),
            payload.to_vec()
        );
        assert_eq!(orch.counter(QueueType::Transfer).last_scheduled(), 1);
        assert_eq!(orch.counter(QueueType::Graphics).last_scheduled(), 0);
    }
}
