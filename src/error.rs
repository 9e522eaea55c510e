use thiserror::Error;

/// Why a gate refused a candidate. The `Display` form is the audit reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateRejection {
    #[error("candidate_missing")]
    CandidateMissing,
    #[error("candidate_not_ok:{0}")]
    CandidateNotOk(String),
    #[error("insufficient_samples:{have}<{need}")]
    InsufficientSamples { have: u64, need: u64 },
    #[error("metric_missing:{0}")]
    MetricMissing(String),
    #[error("{metric}_below_floor:{value:.4}<{floor:.4}")]
    MetricBelowFloor { metric: String, value: f64, floor: f64 },
    #[error("metric_not_improved:{0}")]
    MetricNotImproved(String),
}

/// Pipeline failures. A `ReloadFailed` is reported on a promoted outcome and never undoes it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PromotionError {
    #[error(transparent)]
    Gate(#[from] GateRejection),
    #[error("validation_failed:{job}={failure}")]
    ValidationJobFailed { job: String, failure: String },
    #[error("promote_write_failed:{0}")]
    PromoteWriteFailed(String),
    #[error("reload_failed:{0}")]
    ReloadFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reasons() {
        assert_eq!(GateRejection::CandidateMissing.to_string(), "candidate_missing");
        assert_eq!(
            GateRejection::CandidateNotOk("no_data".to_string()).to_string(),
            "candidate_not_ok:no_data"
        );
        assert_eq!(
            GateRejection::InsufficientSamples { have: 12, need: 200 }.to_string(),
            "insufficient_samples:12<200"
        );
        assert_eq!(
            GateRejection::MetricBelowFloor {
                metric: "auc_10m".to_string(),
                value: 0.65,
                floor: 0.70
            }
            .to_string(),
            "auc_10m_below_floor:0.6500<0.7000"
        );
    }

    #[test]
    fn test_gate_rejection_converts_transparently() {
        let err: PromotionError = GateRejection::MetricMissing("brier".to_string()).into();
        assert_eq!(err.to_string(), "metric_missing:brier");
        assert_eq!(
            PromotionError::ReloadFailed("status=503".to_string()).to_string(),
            "reload_failed:status=503"
        );
    }
}
