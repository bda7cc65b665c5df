#![allow(dead_code)]

use std::sync::Arc;

use futures::executor::LocalPool;
use futures::future::RemoteHandle;
use futures::FutureExt;

use stagecoach::gpu::{NullBackend, NullConfig};
use stagecoach::{Allocator, TransferConfig, TransferOrchestrator};

pub struct Harness {
    pub backend: Arc<NullBackend>,
    pub allocator: Allocator<NullBackend>,
    pub orch: Arc<TransferOrchestrator<NullBackend>>,
}

impl Harness {
    pub fn new(null: NullConfig, staging_bytes: u64) -> Self {
        let backend = Arc::new(NullBackend::new(null));
        let allocator = Allocator::new(backend.clone());
        let orch = TransferOrchestrator::new(
            &allocator,
            TransferConfig::default()
                .with_staging_capacity(staging_bytes)
                .with_debug_labels(true),
        )
        .expect("orchestrator");
        Self {
            backend,
            allocator,
            orch: Arc::new(orch),
        }
    }

    /// Alternates running local tasks and frame boundaries until `handle`
    /// resolves.
    pub fn drive<T: 'static>(&self, pool: &mut LocalPool, mut handle: RemoteHandle<T>) -> T {
        for _ in 0..64 {
            pool.run_until_stalled();
            if let Some(out) = (&mut handle).now_or_never() {
                return out;
            }
            self.orch.end_frame().expect("end_frame");
        }
        panic!("task did not finish within 64 frames");
    }
}
