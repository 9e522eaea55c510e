use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Model kind identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Fillnet,
    Alpha,
    Rugguard,
    Survival,
}

impl ModelKind {
    /// Every kind, in promotion order
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Fillnet,
        ModelKind::Alpha,
        ModelKind::Rugguard,
        ModelKind::Survival,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Fillnet => "fillnet",
            ModelKind::Alpha => "alpha",
            ModelKind::Rugguard => "rugguard",
            ModelKind::Survival => "survival",
        }
    }

    /// Env var carrying the per-kind reload URL override
    pub fn reload_url_env(&self) -> &'static str {
        match self {
            ModelKind::Fillnet => "FILLNET_RELOAD_URL",
            ModelKind::Alpha => "ALPHA_RELOAD_URL",
            ModelKind::Rugguard => "RUGGUARD_RELOAD_URL",
            ModelKind::Survival => "SURVIVAL_RELOAD_URL",
        }
    }
}

impl FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fillnet" => Ok(ModelKind::Fillnet),
            "alpha" => Ok(ModelKind::Alpha),
            "rugguard" => Ok(ModelKind::Rugguard),
            "survival" => Ok(ModelKind::Survival),
            _ => Err(anyhow!("Unknown model kind: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
