use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::gate::GateSettings;
use crate::notifier::ReloadSettings;
use crate::types::ModelKind;
use crate::validation::ValidationSettings;

/// Where one kind's artifacts live and who to tell after a swap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPaths {
    pub candidate_path: PathBuf,
    pub primary_path: PathBuf,
    /// Second production path kept in sync with the primary
    pub alias_path: Option<PathBuf>,
    pub reload_url: Option<String>,
    /// Variable the validation jobs read the candidate path from
    pub model_path_env: String,
}

impl TargetPaths {
    fn new(candidate: &str, primary: &str, alias: Option<&str>, model_path_env: &str) -> Self {
        Self {
            candidate_path: PathBuf::from(candidate),
            primary_path: PathBuf::from(primary),
            alias_path: alias.map(PathBuf::from),
            reload_url: None,
            model_path_env: model_path_env.to_string(),
        }
    }

    pub fn reload_url(&self) -> Option<&str> {
        self.reload_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTable {
    pub fillnet: TargetPaths,
    pub alpha: TargetPaths,
    pub rugguard: TargetPaths,
    pub survival: TargetPaths,
}

impl Default for TargetTable {
    fn default() -> Self {
        Self {
            fillnet: TargetPaths::new(
                "models/fillnet_v2.json",
                "models/fillnet_v2.json",
                Some("models/fillnet.json"),
                "FILLNET_MODEL_PATH",
            ),
            alpha: TargetPaths::new(
                "models/alpha_ranker_v1.json",
                "models/alpha_ranker.json",
                None,
                "ALPHA_MODEL_PATH",
            ),
            rugguard: TargetPaths::new(
                "models/rugguard_v2.json",
                "models/rugguard_v2.json",
                Some("models/rugguard.json"),
                "RUGGUARD_MODEL_PATH",
            ),
            survival: TargetPaths::new(
                "models/survival_v1.json",
                "models/survival.json",
                None,
                "SURVIVAL_MODEL_PATH",
            ),
        }
    }
}

impl TargetTable {
    pub fn get(&self, kind: ModelKind) -> &TargetPaths {
        match kind {
            ModelKind::Fillnet => &self.fillnet,
            ModelKind::Alpha => &self.alpha,
            ModelKind::Rugguard => &self.rugguard,
            ModelKind::Survival => &self.survival,
        }
    }

    pub fn get_mut(&mut self, kind: ModelKind) -> &mut TargetPaths {
        match kind {
            ModelKind::Fillnet => &mut self.fillnet,
            ModelKind::Alpha => &mut self.alpha,
            ModelKind::Rugguard => &mut self.rugguard,
            ModelKind::Survival => &mut self.survival,
        }
    }

    /// Targets in configuration order
    pub fn iter(&self) -> impl Iterator<Item = (ModelKind, &TargetPaths)> {
        ModelKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Relative artifact paths resolve against this directory
    pub base_dir: PathBuf,
    /// Kinds processed at once
    pub concurrency: usize,
    pub targets: TargetTable,
    pub gates: GateSettings,
    pub validation: ValidationSettings,
    pub reload: ReloadSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            concurrency: 4,
            targets: TargetTable::default(),
            gates: GateSettings::default(),
            validation: ValidationSettings::default(),
            reload: ReloadSettings::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.concurrency == 0 {
            errors.push("concurrency must be > 0".to_string());
        }

        for (kind, target) in self.targets.iter() {
            if target.candidate_path.as_os_str().is_empty() {
                errors.push(format!("targets.{}.candidate_path is empty", kind));
            }
            if target.primary_path.as_os_str().is_empty() {
                errors.push(format!("targets.{}.primary_path is empty", kind));
            }
            if target.alias_path.as_ref().map(|p| p.as_os_str().is_empty()).unwrap_or(false) {
                errors.push(format!("targets.{}.alias_path is empty", kind));
            }
            if target.model_path_env.trim().is_empty() {
                errors.push(format!("targets.{}.model_path_env is empty", kind));
            }
            if let Some(url) = target.reload_url() {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("targets.{}.reload_url must be an http(s) URL", kind));
                }
            }
        }

        errors.extend(self.gates.validate());
        errors.extend(self.validation.validate());
        errors.extend(self.reload.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Apply `<KIND>_RELOAD_URL` overrides. A set-but-empty value disables the reload.
    pub fn apply_reload_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for kind in ModelKind::ALL {
            if let Some(url) = lookup(kind.reload_url_env()) {
                let url = url.trim().to_string();
                self.targets.get_mut(kind).reload_url = if url.is_empty() { None } else { Some(url) };
            }
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
