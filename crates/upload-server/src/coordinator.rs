use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use chunkmerge_protocol::{ChunkMetadata, MergeStatus, UploadAck};
use chunkmerge_transfer::{
    ChunkSink, ChunkStore, MergeOptions, MergeOutcome, MergeRegistry, MergeReport, MergeTarget,
    ReassemblyEngine, TransferError, canonical_logical_name,
};

use crate::UploadError;
use crate::multipart::{self, SectionTarget};

/// How a merge triggered by the last chunk is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeDispatch {
    /// The request that delivered the last chunk waits for the merge.
    #[default]
    Inline,
    /// The merge runs on a tracked task; the request returns immediately.
    Background,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding chunk files.
    pub chunk_dir: PathBuf,
    /// Directory for merged files. Defaults to `chunk_dir`.
    pub output_dir: Option<PathBuf>,
    pub merge: MergeOptions,
    pub dispatch: MergeDispatch,
}

impl CoordinatorConfig {
    pub fn new(chunk_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
            output_dir: None,
            merge: MergeOptions::default(),
            dispatch: MergeDispatch::default(),
        }
    }
}

/// Notification emitted after every merge attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    Completed(MergeReport),
    NothingToMerge { logical_name: String },
    Failed { logical_name: String, error: String },
}

/// Callback invoked after a merge finishes, successfully or not.
pub type MergeCallback = Box<dyn Fn(&MergeEvent) + Send + Sync>;

type Callbacks = Arc<RwLock<Vec<MergeCallback>>>;

/// Receives chunks and triggers merges.
pub struct UploadCoordinator {
    store: Arc<ChunkStore>,
    engine: Arc<ReassemblyEngine>,
    registry: Arc<MergeRegistry>,
    dispatch: MergeDispatch,
    callbacks: Callbacks,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl UploadCoordinator {
    /// Creates a coordinator sharing `registry` with any other coordinator
    /// that writes to the same output directory.
    pub fn new(config: CoordinatorConfig, registry: Arc<MergeRegistry>) -> Self {
        Self::with_cancel(config, registry, CancellationToken::new())
    }

    /// Like [`new`](Self::new), with merges stopped when `cancel` fires.
    pub fn with_cancel(
        config: CoordinatorConfig,
        registry: Arc<MergeRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let store = Arc::new(ChunkStore::new(&config.chunk_dir));
        let output = config
            .output_dir
            .clone()
            .unwrap_or_else(|| config.chunk_dir.clone());
        let engine = Arc::new(ReassemblyEngine::new(
            Arc::clone(&store),
            output,
            config.merge.clone(),
        ));

        Self {
            store,
            engine,
            registry,
            dispatch: config.dispatch,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ReassemblyEngine> {
        &self.engine
    }

    /// Registers a callback for merge completion.
    pub fn on_merge(&self, callback: MergeCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Handles one chunk upload request.
    ///
    /// `content_type` is the request's `Content-Type` header and `body` the
    /// raw request body. The content type and metadata are checked before
    /// anything touches the chunk directory. When `meta` marks the final
    /// chunk, a merge of the logical file is triggered.
    pub async fn on_chunk_received<S, O, E>(
        &self,
        meta: ChunkMetadata,
        content_type: Option<&str>,
        body: S,
    ) -> Result<UploadAck, UploadError>
    where
        S: Stream<Item = Result<O, E>> + Send + 'static,
        O: Into<Bytes> + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let boundary = multipart::boundary(content_type)?;
        meta.validate()?;

        let mut form = multer::Multipart::new(body, boundary);
        let mut open: Option<(SectionTarget, ChunkSink)> = None;
        let received = self.receive_sections(&mut form, &meta, &mut open).await;

        let (target, written) = match (received, open) {
            (Ok(()), Some((target, sink))) => {
                let written = sink.finish().await?;
                (target, written)
            }
            (Ok(()), None) => {
                return Err(UploadError::InvalidRequest(
                    "multipart body has no file section".into(),
                ));
            }
            (Err(e), Some((_, sink))) => {
                sink.discard().await;
                return Err(e);
            }
            (Err(e), None) => return Err(e),
        };

        if let Some(expected) = meta.expected_len()
            && expected != written
        {
            warn!(
                logical = %target.logical,
                part = target.part,
                expected,
                written,
                "chunk length differs from announced range"
            );
        }
        info!(
            logical = %target.logical,
            part = target.part,
            chunks = meta.chunks,
            bytes = written,
            "chunk stored"
        );

        let merge = if meta.is_last_chunk() {
            let merge_target = MergeTarget::new(target.logical.clone())
                .with_expected_chunks(meta.chunks)
                .with_expected_total(meta.total);
            self.trigger(merge_target).await?
        } else {
            MergeStatus::NotTriggered
        };

        Ok(UploadAck {
            file_name: target.logical,
            part_number: target.part,
            bytes_written: written,
            merge,
        })
    }

    /// Streams every file section into one chunk sink.
    ///
    /// The sink is left in `open` so the caller can finish or discard it.
    async fn receive_sections(
        &self,
        form: &mut multer::Multipart<'static>,
        meta: &ChunkMetadata,
        open: &mut Option<(SectionTarget, ChunkSink)>,
    ) -> Result<(), UploadError> {
        while let Some(mut field) = form.next_field().await? {
            let target = multipart::resolve_section(field.file_name(), meta)?;

            let entry = match open.take() {
                Some((current, sink)) if current == target => (current, sink),
                Some((current, sink)) => {
                    let message = format!(
                        "sections name different chunks: {}#{} and {}#{}",
                        current.logical, current.part, target.logical, target.part
                    );
                    *open = Some((current, sink));
                    return Err(UploadError::InvalidRequest(message));
                }
                None => {
                    let sink = self
                        .store
                        .begin(&target.logical, target.part, meta.buffer_size())
                        .await?;
                    (target, sink)
                }
            };
            let (_, sink) = open.insert(entry);

            while let Some(bytes) = field.chunk().await? {
                sink.append(&bytes).await?;
            }
        }
        Ok(())
    }

    async fn trigger(&self, target: MergeTarget) -> Result<MergeStatus, UploadError> {
        let Some(guard) = self.registry.lock(&target.logical_name) else {
            info!(logical = %target.logical_name, "merge already in progress, skipping");
            return Ok(MergeStatus::AlreadyInProgress);
        };

        match self.dispatch {
            MergeDispatch::Inline => {
                let outcome = run_merge(&self.engine, &self.callbacks, &target, &self.cancel).await;
                drop(guard);
                Ok(merge_status(outcome?))
            }
            MergeDispatch::Background => {
                let engine = Arc::clone(&self.engine);
                let callbacks = Arc::clone(&self.callbacks);
                let cancel = self.cancel.clone();
                debug!(logical = %target.logical_name, "merge scheduled");
                self.tasks.spawn(async move {
                    let _guard = guard;
                    // Failures are logged by the engine and reported to callbacks.
                    let _ = run_merge(&engine, &callbacks, &target, &cancel).await;
                });
                Ok(MergeStatus::Scheduled)
            }
        }
    }

    /// Merges `target` now, outside of any upload request.
    ///
    /// Fails with [`UploadError::MergeConflict`] without touching the disk if
    /// a merge of the same file is already running.
    pub async fn merge(&self, mut target: MergeTarget) -> Result<MergeOutcome, UploadError> {
        target.logical_name = canonical_logical_name(&target.logical_name)?;
        let Some(_guard) = self.registry.lock(&target.logical_name) else {
            return Err(UploadError::MergeConflict(target.logical_name));
        };
        Ok(run_merge(&self.engine, &self.callbacks, &target, &self.cancel).await?)
    }

    /// Drops every stored chunk of `logical`. Returns how many were removed.
    pub async fn cancel_upload(&self, logical: &str) -> Result<usize, UploadError> {
        let logical = canonical_logical_name(logical)?;
        let Some(_guard) = self.registry.lock(&logical) else {
            return Err(UploadError::MergeConflict(logical));
        };
        let removed = self.store.purge(&logical).await?;
        info!(logical = %logical, removed, "upload cancelled");
        Ok(removed)
    }

    /// Logical files with chunks on disk, with their part numbers.
    pub async fn pending(&self) -> Result<BTreeMap<String, Vec<u32>>, UploadError> {
        Ok(self.store.pending().await?)
    }

    /// Logical files currently being merged.
    pub fn in_flight(&self) -> Vec<String> {
        self.registry.in_flight()
    }

    /// Cancels running merges and waits for background ones to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("upload coordinator stopped");
    }

    /// Waits for scheduled background merges without cancelling them.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn run_merge(
    engine: &ReassemblyEngine,
    callbacks: &Callbacks,
    target: &MergeTarget,
    cancel: &CancellationToken,
) -> Result<MergeOutcome, TransferError> {
    let result = engine.merge(target, cancel).await;

    let event = match &result {
        Ok(MergeOutcome::Merged(report)) => MergeEvent::Completed(report.clone()),
        Ok(MergeOutcome::NothingToMerge) => MergeEvent::NothingToMerge {
            logical_name: target.logical_name.clone(),
        },
        Err(e) => MergeEvent::Failed {
            logical_name: target.logical_name.clone(),
            error: e.to_string(),
        },
    };
    for callback in callbacks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
    {
        callback(&event);
    }

    result
}

/// Wire form of a merge outcome.
pub fn merge_status(outcome: MergeOutcome) -> MergeStatus {
    match outcome {
        MergeOutcome::NothingToMerge => MergeStatus::NothingToMerge,
        MergeOutcome::Merged(report) => MergeStatus::Completed {
            parts: report.parts,
            bytes: report.bytes_written,
            path: report.destination.display().to_string(),
            sha256: report.sha256,
        },
    }
}
