//! Per-kind acceptance policies applied to a candidate before validation.
//!
//! Gates are pure: they only look at the two descriptors and their own
//! thresholds. A missing metric always fails the check that needs it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GateRejection;
use crate::types::{Metrics, ModelDescriptor, ModelKind};

/// Slack for float comparisons against configured thresholds
const EPS: f64 = 1e-12;

const BRIER_NAMES: &[&str] = &["brier", "pfill_brier_holdout"];
const SLIP_MAPE_NAMES: &[&str] = &["slip_mape"];
const AUC_10M_NAMES: &[&str] = &["auc_10m", "10m.auc_holdout"];
const PRECISION_60M_NAMES: &[&str] = &["precision_at_50_60m", "60m.precision_at_50_holdout"];
const RUG_AUC_NAMES: &[&str] = &["auc", "auc_holdout"];
const RUG_F1_NAMES: &[&str] = &["f1"];

/// Gate verdict for one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept(String),
    Reject(GateRejection),
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accept(_))
    }

    pub fn reason(&self) -> String {
        match self {
            GateDecision::Accept(reason) => reason.clone(),
            GateDecision::Reject(rejection) => rejection.to_string(),
        }
    }
}

impl From<Result<String, GateRejection>> for GateDecision {
    fn from(result: Result<String, GateRejection>) -> Self {
        match result {
            Ok(reason) => GateDecision::Accept(reason),
            Err(rejection) => GateDecision::Reject(rejection),
        }
    }
}

/// Fill-probability / slippage model thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillnetGate {
    pub min_train_samples: u64,
    /// Required drop in brier versus the current model
    pub min_brier_improvement: f64,
    pub max_slip_mape: f64,
    /// Brier regression allowed when slippage error is acceptable
    pub brier_tolerance: f64,
}

impl Default for FillnetGate {
    fn default() -> Self {
        Self {
            min_train_samples: 200,
            min_brier_improvement: 0.02,
            max_slip_mape: 0.25,
            brier_tolerance: 0.005,
        }
    }
}

impl FillnetGate {
    fn check(
        &self,
        current: Option<&ModelDescriptor>,
        candidate: &ModelDescriptor,
    ) -> Result<String, GateRejection> {
        require_samples(candidate.train_size, "train_size", self.min_train_samples)?;
        let brier = require_metric(&candidate.metrics, BRIER_NAMES)?;

        let baseline = current
            .and_then(|c| c.metrics.first_of(BRIER_NAMES))
            .map(|(_, v)| v);

        if let Some(current_brier) = baseline {
            let delta = current_brier - brier;
            if delta + EPS >= self.min_brier_improvement {
                return Ok(format!("brier_improved:{:.4}", delta));
            }
        }

        // Without a production baseline there is nothing to regress from
        let delta = baseline.map(|b| b - brier).unwrap_or(0.0);
        let regression = -delta;
        let mape = require_metric(&candidate.metrics, SLIP_MAPE_NAMES)?;

        if mape > self.max_slip_mape + EPS {
            return Err(GateRejection::MetricNotImproved(format!(
                "slip_mape={:.4}>{:.4}",
                mape, self.max_slip_mape
            )));
        }
        if regression > self.brier_tolerance + EPS {
            return Err(GateRejection::MetricNotImproved(format!(
                "brier_regressed={:.4}>{:.4}",
                regression, self.brier_tolerance
            )));
        }
        Ok(format!("slip_mape_ok:{:.4},brier_delta:{:.4}", mape, delta))
    }
}

/// Alpha ranker thresholds. Absolute bars; the current model is not consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlphaGate {
    pub min_train_samples: u64,
    pub min_auc_10m: f64,
    /// Applied only when the candidate reports the metric
    pub min_precision_at_50_60m: f64,
}

impl Default for AlphaGate {
    fn default() -> Self {
        Self {
            min_train_samples: 200,
            min_auc_10m: 0.70,
            min_precision_at_50_60m: 0.50,
        }
    }
}

impl AlphaGate {
    fn check(&self, candidate: &ModelDescriptor) -> Result<String, GateRejection> {
        require_samples(candidate.train_size, "train_size", self.min_train_samples)?;
        let auc = require_metric(&candidate.metrics, AUC_10M_NAMES)?;
        require_floor("auc_10m", auc, self.min_auc_10m)?;
        if let Some((_, precision)) = candidate.metrics.first_of(PRECISION_60M_NAMES) {
            require_floor("precision_at_50_60m", precision, self.min_precision_at_50_60m)?;
        }
        Ok(format!("auc_10m_ok:{:.4}", auc))
    }
}

/// Rug-risk classifier thresholds; metric floors apply only when reported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RugguardGate {
    pub min_train_samples: u64,
    pub min_auc: f64,
    pub min_f1: f64,
}

impl Default for RugguardGate {
    fn default() -> Self {
        Self {
            min_train_samples: 50,
            min_auc: 0.60,
            min_f1: 0.30,
        }
    }
}

impl RugguardGate {
    fn check(&self, candidate: &ModelDescriptor) -> Result<String, GateRejection> {
        require_samples(candidate.train_size, "train_size", self.min_train_samples)?;
        if let Some((_, auc)) = candidate.metrics.first_of(RUG_AUC_NAMES) {
            require_floor("auc", auc, self.min_auc)?;
        }
        if let Some((_, f1)) = candidate.metrics.first_of(RUG_F1_NAMES) {
            require_floor("f1", f1, self.min_f1)?;
        }
        Ok("accepted_via_ope_guard".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalGate {
    pub min_samples: u64,
}

impl Default for SurvivalGate {
    fn default() -> Self {
        Self { min_samples: 30 }
    }
}

impl SurvivalGate {
    fn check(&self, candidate: &ModelDescriptor) -> Result<String, GateRejection> {
        require_samples(candidate.sample_count(), "sample_size", self.min_samples)?;
        Ok("accepted_via_ope_guard".to_string())
    }
}

/// Gate thresholds for every kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateSettings {
    pub fillnet: FillnetGate,
    pub alpha: AlphaGate,
    pub rugguard: RugguardGate,
    pub survival: SurvivalGate,
}

impl GateSettings {
    pub fn policy_for(&self, kind: ModelKind) -> GatePolicy {
        match kind {
            ModelKind::Fillnet => GatePolicy::Fillnet(self.fillnet.clone()),
            ModelKind::Alpha => GatePolicy::Alpha(self.alpha.clone()),
            ModelKind::Rugguard => GatePolicy::Rugguard(self.rugguard.clone()),
            ModelKind::Survival => GatePolicy::Survival(self.survival.clone()),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let unit = |name: &str, v: f64, errors: &mut Vec<String>| {
            if !(0.0..=1.0).contains(&v) {
                errors.push(format!("gates.{} must be between 0 and 1", name));
            }
        };
        unit("fillnet.min_brier_improvement", self.fillnet.min_brier_improvement, &mut errors);
        unit("fillnet.brier_tolerance", self.fillnet.brier_tolerance, &mut errors);
        if self.fillnet.max_slip_mape < 0.0 {
            errors.push("gates.fillnet.max_slip_mape must be >= 0".to_string());
        }
        unit("alpha.min_auc_10m", self.alpha.min_auc_10m, &mut errors);
        unit("alpha.min_precision_at_50_60m", self.alpha.min_precision_at_50_60m, &mut errors);
        unit("rugguard.min_auc", self.rugguard.min_auc, &mut errors);
        unit("rugguard.min_f1", self.rugguard.min_f1, &mut errors);
        errors
    }
}

/// Acceptance policy for one model kind
#[derive(Debug, Clone)]
pub enum GatePolicy {
    Fillnet(FillnetGate),
    Alpha(AlphaGate),
    Rugguard(RugguardGate),
    Survival(SurvivalGate),
}

impl GatePolicy {
    pub fn kind(&self) -> ModelKind {
        match self {
            GatePolicy::Fillnet(_) => ModelKind::Fillnet,
            GatePolicy::Alpha(_) => ModelKind::Alpha,
            GatePolicy::Rugguard(_) => ModelKind::Rugguard,
            GatePolicy::Survival(_) => ModelKind::Survival,
        }
    }

    pub fn evaluate(
        &self,
        current: Option<&ModelDescriptor>,
        candidate: Option<&ModelDescriptor>,
    ) -> GateDecision {
        let decision: GateDecision = self.check(current, candidate).into();
        debug!("Gate {}: {}", self.kind(), decision.reason());
        decision
    }

    fn check(
        &self,
        current: Option<&ModelDescriptor>,
        candidate: Option<&ModelDescriptor>,
    ) -> Result<String, GateRejection> {
        let candidate = candidate.ok_or(GateRejection::CandidateMissing)?;
        if !candidate.is_ok() {
            return Err(GateRejection::CandidateNotOk(candidate.status.to_string()));
        }
        match self {
            GatePolicy::Fillnet(gate) => gate.check(current, candidate),
            GatePolicy::Alpha(gate) => gate.check(candidate),
            GatePolicy::Rugguard(gate) => gate.check(candidate),
            GatePolicy::Survival(gate) => gate.check(candidate),
        }
    }
}

/// Evaluate the gate for `kind` with the given thresholds
pub fn evaluate(
    settings: &GateSettings,
    kind: ModelKind,
    current: Option<&ModelDescriptor>,
    candidate: Option<&ModelDescriptor>,
) -> GateDecision {
    settings.policy_for(kind).evaluate(current, candidate)
}

fn require_samples(have: Option<u64>, field: &str, need: u64) -> Result<u64, GateRejection> {
    let have = have.ok_or_else(|| GateRejection::MetricMissing(field.to_string()))?;
    if have < need {
        return Err(GateRejection::InsufficientSamples { have, need });
    }
    Ok(have)
}

fn require_metric(metrics: &Metrics, names: &[&str]) -> Result<f64, GateRejection> {
    metrics
        .first_of(names)
        .map(|(_, v)| v)
        .ok_or_else(|| GateRejection::MetricMissing(names[0].to_string()))
}

fn require_floor(metric: &str, value: f64, floor: f64) -> Result<(), GateRejection> {
    if value + EPS < floor {
        return Err(GateRejection::MetricBelowFloor {
            metric: metric.to_string(),
            value,
            floor,
        });
    }
    Ok(())
}
