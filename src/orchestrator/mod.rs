//! Drives every model kind through gate → validate → promote → notify.

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactRead, ArtifactStore};
use crate::config::{GatewayConfig, TargetTable};
use crate::error::GateRejection;
use crate::gate::{self, GateDecision, GateSettings};
use crate::notifier::ReloadNotifier;
use crate::promoter::Promoter;
use crate::types::{ModelKind, PipelineStage, PromotionOutcome};
use crate::validation::{JobExecutor, ProcessExecutor, ValidationRunner};

/// Dry-run verdict for one kind
#[derive(Debug, Clone)]
pub struct GateReport {
    pub kind: ModelKind,
    pub decision: GateDecision,
}

impl fmt::Display for GateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.decision.is_accepted() { "accept" } else { "reject" };
        write!(f, "GATE {}={} reason={}", self.kind, verdict, self.decision.reason())
    }
}

/// What is on disk for one kind right now
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub kind: ModelKind,
    pub candidate: (PathBuf, ArtifactRead),
    pub production: (PathBuf, ArtifactRead),
    pub alias: Option<(PathBuf, ArtifactRead)>,
    pub reload_url: Option<String>,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        writeln!(f, "  candidate   {} {}", self.candidate.0.display(), self.candidate.1.describe())?;
        writeln!(f, "  production  {} {}", self.production.0.display(), self.production.1.describe())?;
        if let Some((path, read)) = &self.alias {
            writeln!(f, "  alias       {} {}", path.display(), read.describe())?;
        }
        write!(f, "  reload      {}", self.reload_url.as_deref().unwrap_or("-"))
    }
}

pub struct PromotionOrchestrator {
    targets: TargetTable,
    gates: GateSettings,
    concurrency: usize,
    store: ArtifactStore,
    runner: ValidationRunner,
    promoter: Promoter,
    notifier: ReloadNotifier,
}

impl PromotionOrchestrator {
    pub fn new(config: &GatewayConfig, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            targets: config.targets.clone(),
            gates: config.gates.clone(),
            concurrency: config.concurrency.max(1),
            store: ArtifactStore::new(&config.base_dir),
            runner: ValidationRunner::new(executor, config.validation.clone()),
            promoter: Promoter::new(),
            notifier: ReloadNotifier::from_settings(&config.reload),
        }
    }

    /// Orchestrator that runs validation jobs as real child processes
    pub fn from_config(config: &GatewayConfig) -> Self {
        let executor = Arc::new(ProcessExecutor::from_settings(&config.validation));
        Self::new(config, executor)
    }

    /// Requested kinds in configuration order, without duplicates. Empty means all.
    pub fn select(kinds: &[ModelKind]) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| kinds.is_empty() || kinds.contains(kind))
            .collect()
    }

    /// When training writes straight into the primary path, the alias still
    /// holds the last promoted model and is the baseline.
    fn current_and_candidate(&self, kind: ModelKind) -> (ArtifactRead, ArtifactRead) {
        let target = self.targets.get(kind);
        let in_place = self.store.resolve(&target.primary_path) == self.store.resolve(&target.candidate_path);
        let baseline = match &target.alias_path {
            Some(alias) if in_place => alias,
            _ => &target.primary_path,
        };
        (self.store.read(baseline), self.store.read(&target.candidate_path))
    }

    /// Gate decision plus the candidate exactly as it was read for it
    fn gate(&self, kind: ModelKind) -> (GateDecision, ArtifactRead) {
        let (current, candidate) = self.current_and_candidate(kind);
        let decision = gate::evaluate(&self.gates, kind, current.descriptor(), candidate.descriptor());
        (decision, candidate)
    }

    /// One full cycle for one kind. Never fails: every problem is a skipped outcome.
    pub async fn run_target(&self, kind: ModelKind) -> PromotionOutcome {
        let target = self.targets.get(kind);

        let (decision, candidate_read) = self.gate(kind);
        let accepted = match decision {
            GateDecision::Accept(reason) => {
                info!("{} gate accepted: {}", kind, reason);
                reason
            }
            GateDecision::Reject(rejection) => {
                warn!("{} gate rejected: {}", kind, rejection);
                return PromotionOutcome::skipped(kind, PipelineStage::Gate, rejection.to_string());
            }
        };
        let Some(gated_digest) = candidate_read.digest() else {
            return PromotionOutcome::skipped(kind, PipelineStage::Gate, GateRejection::CandidateMissing.to_string());
        };

        let candidate_abs = self.store.absolute(&target.candidate_path);
        let env = HashMap::from([(
            target.model_path_env.clone(),
            candidate_abs.to_string_lossy().into_owned(),
        )]);
        let validation = self.runner.run_validation(&env).await;
        if !validation.passed {
            let reason = validation
                .failure()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "validation_failed".to_string());
            warn!("{} validation over {} .. {} failed: {}", kind, validation.from, validation.to, reason);
            return PromotionOutcome::skipped(kind, PipelineStage::Validate, reason);
        }
        info!("{} validation over {} .. {} passed", kind, validation.from, validation.to);

        let candidate = self.store.resolve(&target.candidate_path);
        let primary = self.store.resolve(&target.primary_path);
        let alias = target.alias_path.as_ref().map(|p| self.store.resolve(p));
        let receipt = match self
            .promoter
            .promote(&candidate, gated_digest, &primary, alias.as_deref())
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("{} promotion failed: {}", kind, e);
                return PromotionOutcome::skipped(kind, PipelineStage::Promote, e.to_string());
            }
        };
        info!(
            "{} now serving sha256 {} ({} written, {} unchanged)",
            kind,
            receipt.digest.get(..12).unwrap_or(&receipt.digest),
            receipt.written.len(),
            receipt.unchanged.len()
        );

        let reload = self.notifier.notify(target.reload_url()).await;
        if reload.is_failure() {
            warn!("{} promoted but reload failed: {}", kind, reload);
        }
        PromotionOutcome::promoted(kind, accepted, reload)
    }

    /// Run the selected kinds concurrently. Outcomes come back in configuration order.
    pub async fn run_all(self: &Arc<Self>, kinds: &[ModelKind]) -> Vec<PromotionOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let selected = Self::select(kinds);
        let handles = selected.iter().map(|&kind| {
            let orchestrator = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                orchestrator.run_target(kind).await
            })
        });
        let results = join_all(handles).await;

        selected
            .into_iter()
            .zip(results)
            .map(|(kind, result)| {
                result.unwrap_or_else(|e| {
                    error!("{} pipeline aborted: {}", kind, e);
                    PromotionOutcome::skipped(kind, PipelineStage::Gate, "internal_error")
                })
            })
            .collect()
    }

    /// Gate evaluation only: no jobs, no writes
    pub fn evaluate_gates(&self, kinds: &[ModelKind]) -> Vec<GateReport> {
        Self::select(kinds)
            .into_iter()
            .map(|kind| GateReport {
                kind,
                decision: self.gate(kind).0,
            })
            .collect()
    }

    pub fn status_report(&self, kinds: &[ModelKind]) -> Vec<TargetStatus> {
        Self::select(kinds)
            .into_iter()
            .map(|kind| {
                let target = self.targets.get(kind);
                let entry = |path: &PathBuf| (self.store.resolve(path), self.store.read(path));
                TargetStatus {
                    kind,
                    candidate: entry(&target.candidate_path),
                    production: entry(&target.primary_path),
                    alias: target.alias_path.as_ref().map(entry),
                    reload_url: target.reload_url().map(str::to_string),
                }
            })
            .collect()
    }
}
