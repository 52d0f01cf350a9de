//! Pipeline coordinator.
//!
//! Serializes backup, restore and delete operations inside one process and
//! tracks in-flight artifact downloads. All state sits behind a single mutex;
//! cross-process uniqueness of runs is enforced separately by the repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Kind of operation holding the pipeline claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Backup,
    Restore,
    Delete,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Backup => "backup",
            PipelineKind::Restore => "restore",
            PipelineKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    claim: Option<(PipelineKind, u64)>,
    next_claim_id: u64,
    downloads: HashMap<Uuid, usize>,
}

/// Process-wide state holder for pipeline claims and download counters.
#[derive(Debug, Default)]
pub struct PipelineCoordinator {
    state: Mutex<CoordinatorState>,
    jobs_paused: AtomicBool,
}

impl PipelineCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        // Critical sections never panic midway, so a poisoned lock still holds
        // consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the pipeline for `kind`. Fails if any claim is already held.
    pub fn begin_pipeline(self: &Arc<Self>, kind: PipelineKind) -> Result<PipelineClaim> {
        let mut state = self.lock();
        if let Some((held, _)) = state.claim {
            return Err(AppError::ConcurrentOperation(format!(
                "cannot start {}: a {} operation is in progress",
                kind.as_str(),
                held.as_str()
            )));
        }
        state.next_claim_id += 1;
        let claim_id = state.next_claim_id;
        state.claim = Some((kind, claim_id));
        tracing::debug!(kind = kind.as_str(), claim_id, "Pipeline claimed");

        Ok(PipelineClaim {
            coordinator: Arc::clone(self),
            kind,
            claim_id,
            released: false,
        })
    }

    /// Release the claim if it is still held by `kind`.
    pub fn end_pipeline(&self, kind: PipelineKind) -> bool {
        let mut state = self.lock();
        match state.claim {
            Some((held, _)) if held == kind => {
                state.claim = None;
                true
            }
            _ => false,
        }
    }

    fn release_claim(&self, kind: PipelineKind, claim_id: u64) {
        let mut state = self.lock();
        if state.claim == Some((kind, claim_id)) {
            state.claim = None;
            tracing::debug!(kind = kind.as_str(), claim_id, "Pipeline released");
        }
    }

    /// Kind currently holding the claim, if any.
    pub fn active_pipeline(&self) -> Option<PipelineKind> {
        self.lock().claim.map(|(kind, _)| kind)
    }

    /// Register a download of `artifact_id`. Refused while a delete or
    /// restore holds the pipeline.
    pub fn begin_download(self: &Arc<Self>, artifact_id: Uuid) -> Result<DownloadGuard> {
        let mut state = self.lock();
        if let Some((held @ (PipelineKind::Delete | PipelineKind::Restore), _)) = state.claim {
            return Err(AppError::ConcurrentOperation(format!(
                "downloads are blocked while a {} is in progress",
                held.as_str()
            )));
        }
        *state.downloads.entry(artifact_id).or_insert(0) += 1;

        Ok(DownloadGuard {
            coordinator: Arc::clone(self),
            artifact_id,
            released: false,
        })
    }

    /// Drop one download reference for `artifact_id`.
    pub fn end_download(&self, artifact_id: Uuid) {
        let mut state = self.lock();
        if let Some(count) = state.downloads.get_mut(&artifact_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.downloads.remove(&artifact_id);
            }
        }
    }

    pub fn active_downloads(&self, artifact_id: Uuid) -> usize {
        self.lock().downloads.get(&artifact_id).copied().unwrap_or(0)
    }

    /// Ask recurring jobs to stand down until [`resume_jobs`](Self::resume_jobs).
    pub fn pause_jobs(&self) {
        self.jobs_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_jobs(&self) {
        self.jobs_paused.store(false, Ordering::SeqCst);
    }

    pub fn jobs_paused(&self) -> bool {
        self.jobs_paused.load(Ordering::SeqCst)
    }
}

/// Held pipeline claim. Released on drop.
#[derive(Debug)]
pub struct PipelineClaim {
    coordinator: Arc<PipelineCoordinator>,
    kind: PipelineKind,
    claim_id: u64,
    released: bool,
}

impl PipelineClaim {
    pub fn release(mut self) {
        self.coordinator.release_claim(self.kind, self.claim_id);
        self.released = true;
    }
}

impl Drop for PipelineClaim {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release_claim(self.kind, self.claim_id);
        }
    }
}

/// Held download reference. Released on drop.
#[derive(Debug)]
pub struct DownloadGuard {
    coordinator: Arc<PipelineCoordinator>,
    artifact_id: Uuid,
    released: bool,
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.coordinator.end_download(self.artifact_id);
        }
    }
}
