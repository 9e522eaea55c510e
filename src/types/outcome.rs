use serde::{Serialize, Serializer};

use super::ModelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Promoted,
    Skipped,
}

/// Last pipeline stage a kind reached in a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Gate,
    Validate,
    Promote,
    Done,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Gate => write!(f, "gate"),
            PipelineStage::Validate => write!(f, "validate"),
            PipelineStage::Promote => write!(f, "promote"),
            PipelineStage::Done => write!(f, "done"),
        }
    }
}

/// Result of a reload notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadStatus {
    /// No endpoint configured for the kind
    Skipped,
    Ok(u16),
    Failed(String),
}

impl ReloadStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ReloadStatus::Failed(_))
    }
}

impl std::fmt::Display for ReloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadStatus::Skipped => write!(f, "skipped(no_url)"),
            ReloadStatus::Ok(code) => write!(f, "ok({})", code),
            ReloadStatus::Failed(cause) => write!(f, "failed({})", cause),
        }
    }
}

impl Serialize for ReloadStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one promotion cycle for one model kind
#[derive(Debug, Clone, Serialize)]
pub struct PromotionOutcome {
    pub kind: ModelKind,
    pub decision: Decision,
    pub reason: String,
    pub stage: PipelineStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload: Option<ReloadStatus>,
}

impl PromotionOutcome {
    pub fn promoted(kind: ModelKind, reason: impl Into<String>, reload: ReloadStatus) -> Self {
        Self {
            kind,
            decision: Decision::Promoted,
            reason: reason.into(),
            stage: PipelineStage::Done,
            reload: Some(reload),
        }
    }

    pub fn skipped(kind: ModelKind, stage: PipelineStage, reason: impl Into<String>) -> Self {
        Self {
            kind,
            decision: Decision::Skipped,
            reason: reason.into(),
            stage,
            reload: None,
        }
    }

    pub fn is_promoted(&self) -> bool {
        self.decision == Decision::Promoted
    }
}

impl std::fmt::Display for PromotionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decision {
            Decision::Promoted => {
                write!(f, "PROMOTE {}=ok reason={}", self.kind, self.reason)?;
                if let Some(reload) = &self.reload {
                    write!(f, " reload={}", reload)?;
                }
                Ok(())
            }
            Decision::Skipped => write!(f, "PROMOTE {}=skipped reason={}", self.kind, self.reason),
        }
    }
}
