//! Atomic candidate → production artifact swap.
//!
//! Every destination is written as `.<name>.<uuid>.tmp` in its own directory,
//! fsynced, then renamed over the destination. All destinations are staged
//! before any is committed, so a failure while staging leaves production
//! untouched.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts;
use crate::error::PromotionError;

/// What a successful promotion did
#[derive(Debug, Clone)]
pub struct PromotionReceipt {
    /// SHA-256 of the promoted bytes
    pub digest: String,
    pub written: Vec<PathBuf>,
    /// Destinations that already held the candidate bytes
    pub unchanged: Vec<PathBuf>,
}

/// Candidate bytes written next to a destination but not yet visible there.
///
/// Dropping an uncommitted artifact removes its temporary file.
#[derive(Debug)]
pub struct StagedArtifact {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedArtifact {
    pub fn stage(dest: &Path, bytes: &[u8]) -> io::Result<Self> {
        let file_name = dest
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"))?
            .to_string_lossy()
            .into_owned();
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
        let staged = Self {
            tmp,
            dest: dest.to_path_buf(),
            committed: false,
        };

        let mut file = File::create(&staged.tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(staged)
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Rename the staged file over the destination
    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.tmp, &self.dest)?;
        self.committed = true;
        sync_parent(&self.dest);
        Ok(())
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

#[cfg(test)]
impl StagedArtifact {
    pub fn tmp_path(&self) -> &Path {
        &self.tmp
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn write_failed(op: &str, path: &Path, e: io::Error) -> PromotionError {
    PromotionError::PromoteWriteFailed(format!("{} {}: {}", op, path.display(), e))
}

/// Copies candidates into production paths, one writer per path at a time
#[derive(Debug, Default)]
pub struct Promoter {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Promoter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Copy `candidate` over `primary` (and `alias`). The candidate must still
    /// hash to `expected_digest`, the digest of the bytes that were gated.
    pub async fn promote(
        &self,
        candidate: &Path,
        expected_digest: &str,
        primary: &Path,
        alias: Option<&Path>,
    ) -> Result<PromotionReceipt, PromotionError> {
        let mut dests = vec![primary.to_path_buf()];
        if let Some(alias) = alias.filter(|a| *a != primary) {
            dests.push(alias.to_path_buf());
        }

        // stable order so two cycles never wait on each other
        let mut lock_order = dests.clone();
        lock_order.sort();
        let mut guards = Vec::with_capacity(lock_order.len());
        for path in &lock_order {
            guards.push(self.lock_for(path).lock_owned().await);
        }

        let candidate = candidate.to_path_buf();
        let expected = expected_digest.to_string();
        let result = tokio::task::spawn_blocking(move || promote_locked(&candidate, &expected, &dests))
            .await
            .unwrap_or_else(|e| Err(PromotionError::PromoteWriteFailed(format!("promote task: {}", e))));
        drop(guards);
        result
    }
}

fn promote_locked(
    candidate: &Path,
    expected_digest: &str,
    dests: &[PathBuf],
) -> Result<PromotionReceipt, PromotionError> {
    let bytes = fs::read(candidate).map_err(|e| write_failed("read", candidate, e))?;
    let digest = artifacts::digest(&bytes);
    if digest != expected_digest {
        warn!(
            "{} changed since it was gated (sha256 {} != {})",
            candidate.display(),
            &digest[..12],
            expected_digest
        );
        return Err(PromotionError::PromoteWriteFailed("candidate_changed".to_string()));
    }

    let mut staged = Vec::with_capacity(dests.len());
    let mut unchanged = Vec::new();
    for dest in dests {
        let existing = match fs::read(dest) {
            Ok(existing) => Some(existing),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(write_failed("read", dest, e)),
        };
        if existing.as_deref() == Some(bytes.as_slice()) {
            unchanged.push(dest.clone());
            continue;
        }
        let artifact = StagedArtifact::stage(dest, &bytes).map_err(|e| write_failed("stage", dest, e))?;
        staged.push((artifact, existing));
    }

    let mut committed: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
    for (artifact, prior) in staged {
        let dest = artifact.dest().to_path_buf();
        if let Err(e) = artifact.commit() {
            rollback(&committed);
            return Err(write_failed("commit", &dest, e));
        }
        committed.push((dest, prior));
    }

    let written: Vec<PathBuf> = committed.into_iter().map(|(dest, _)| dest).collect();
    for dest in &written {
        info!("Promoted {} -> {} (sha256 {})", candidate.display(), dest.display(), &digest[..12]);
    }
    for dest in &unchanged {
        debug!("{} already holds sha256 {}", dest.display(), &digest[..12]);
    }

    Ok(PromotionReceipt {
        digest,
        written,
        unchanged,
    })
}

/// Put back the prior contents of already-committed destinations
fn rollback(committed: &[(PathBuf, Option<Vec<u8>>)]) {
    for (dest, prior) in committed.iter().rev() {
        let restored = match prior {
            Some(bytes) => StagedArtifact::stage(dest, bytes).and_then(StagedArtifact::commit),
            None => fs::remove_file(dest),
        };
        match restored {
            Ok(()) => warn!("Rolled back {}", dest.display()),
            Err(e) => error!("Rollback of {} failed: {}", dest.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(path: &Path) -> String {
        artifacts::digest(&fs::read(path).unwrap())
    }

    fn tmp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|x| x == "tmp").unwrap_or(false))
            .collect()
    }

    #[tokio::test]
    async fn test_promote_primary_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("rugguard_v2.next.json");
        let primary = dir.path().join("rugguard_v2.json");
        let alias = dir.path().join("legacy/rugguard.json");
        fs::write(&candidate, b"{\"status\":\"ok\"}").unwrap();
        fs::write(&primary, b"{\"status\":\"old\"}").unwrap();

        let receipt = Promoter::new()
            .promote(&candidate, &digest_of(&candidate), &primary, Some(&alias))
            .await
            .unwrap();

        assert_eq!(fs::read(&primary).unwrap(), b"{\"status\":\"ok\"}");
        assert_eq!(fs::read(&alias).unwrap(), b"{\"status\":\"ok\"}");
        assert_eq!(receipt.written.len(), 2);
        assert_eq!(receipt.digest.len(), 64);
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_candidate_fails_without_touching_production() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("alpha_ranker.json");
        fs::write(&primary, b"current").unwrap();

        let err = Promoter::new()
            .promote(&dir.path().join("nope.json"), "", &primary, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PromotionError::PromoteWriteFailed(_)));
        assert_eq!(fs::read(&primary).unwrap(), b"current");
    }

    #[test]
    fn test_crash_before_rename_leaves_production_intact() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("survival.json");
        fs::write(&primary, b"prior model").unwrap();

        let staged = StagedArtifact::stage(&primary, b"half-promoted model").unwrap();
        let tmp = staged.tmp_path().to_path_buf();
        // process dies here: no commit, no drop
        std::mem::forget(staged);

        assert_eq!(fs::read(&primary).unwrap(), b"prior model");
        assert_eq!(fs::read(&tmp).unwrap(), b"half-promoted model");
    }

    #[tokio::test]
    async fn test_stale_tmp_does_not_block_next_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("cand.json");
        let primary = dir.path().join("prod.json");
        fs::write(&candidate, b"new").unwrap();
        fs::write(&primary, b"old").unwrap();
        std::mem::forget(StagedArtifact::stage(&primary, b"crashed").unwrap());

        Promoter::new().promote(&candidate, &digest_of(&candidate), &primary, None).await.unwrap();
        assert_eq!(fs::read(&primary).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_alias_staging_failure_leaves_primary_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("cand.json");
        let primary = dir.path().join("fillnet_v2.json");
        // alias parent is a regular file, so the alias cannot be staged
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();
        let alias = blocker.join("fillnet.json");
        fs::write(&candidate, b"new").unwrap();
        fs::write(&primary, b"old").unwrap();

        let err = Promoter::new()
            .promote(&candidate, &digest_of(&candidate), &primary, Some(&alias))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("promote_write_failed:stage"));
        assert_eq!(fs::read(&primary).unwrap(), b"old");
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_alias_commit_failure_rolls_back_primary() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("cand.json");
        let primary = dir.path().join("rugguard_v2.json");
        // a non-empty directory cannot be replaced by rename
        let alias = dir.path().join("rugguard.json");
        fs::create_dir(&alias).unwrap();
        fs::write(alias.join("keep"), b"x").unwrap();
        fs::write(&candidate, b"new").unwrap();
        fs::write(&primary, b"old").unwrap();

        let err = Promoter::new()
            .promote(&candidate, &digest_of(&candidate), &primary, Some(&alias))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("promote_write_failed:commit"));
        assert_eq!(fs::read(&primary).unwrap(), b"old");
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_promoting_twice_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("cand.json");
        let primary = dir.path().join("prod.json");
        let alias = dir.path().join("alias.json");
        fs::write(&candidate, b"{\"status\":\"ok\",\"metrics\":{}}").unwrap();

        let promoter = Promoter::new();
        let first = promoter.promote(&candidate, &digest_of(&candidate), &primary, Some(&alias)).await.unwrap();
        let second = promoter.promote(&candidate, &digest_of(&candidate), &primary, Some(&alias)).await.unwrap();

        assert_eq!(first.written.len(), 2);
        assert!(second.written.is_empty());
        assert_eq!(second.unchanged.len(), 2);
        assert_eq!(first.digest, second.digest);
        assert_eq!(fs::read(&primary).unwrap(), fs::read(&candidate).unwrap());
    }

    #[tokio::test]
    async fn test_candidate_equal_to_primary() {
        // fillnet trains straight into its production path
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("fillnet_v2.json");
        let alias = dir.path().join("fillnet.json");
        fs::write(&primary, b"trained").unwrap();

        let receipt = Promoter::new().promote(&primary, &digest_of(&primary), &primary, Some(&alias)).await.unwrap();
        assert_eq!(receipt.unchanged, vec![primary.clone()]);
        assert_eq!(receipt.written, vec![alias.clone()]);
        assert_eq!(fs::read(&alias).unwrap(), b"trained");
    }

    #[tokio::test]
    async fn test_concurrent_promotions_keep_pair_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("prod.json");
        let alias = dir.path().join("alias.json");
        let promoter = Arc::new(Promoter::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let candidate = dir.path().join(format!("cand-{}.json", i));
            fs::write(&candidate, format!("model-{}", i)).unwrap();
            let digest = digest_of(&candidate);
            let promoter = Arc::clone(&promoter);
            let (primary, alias) = (primary.clone(), alias.clone());
            handles.push(tokio::spawn(async move {
                promoter.promote(&candidate, &digest, &primary, Some(&alias)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fs::read(&primary).unwrap(), fs::read(&alias).unwrap());
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_candidate_rewritten_after_gating_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("alpha_ranker_v1.json");
        let primary = dir.path().join("alpha_ranker.json");
        fs::write(&candidate, br#"{"status":"ok","metrics":{"auc_10m":0.9}}"#).unwrap();
        fs::write(&primary, b"prior").unwrap();
        let gated = digest_of(&candidate);

        // a new training run lands while validation is running
        fs::write(&candidate, br#"{"status":"no_data","metrics":{}}"#).unwrap();

        let err = Promoter::new()
            .promote(&candidate, &gated, &primary, None)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "promote_write_failed:candidate_changed");
        assert_eq!(fs::read(&primary).unwrap(), b"prior");
        assert!(tmp_files(dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_production_entry_aborts_before_staging() {
        let dir = tempfile::tempdir().unwrap();
        let candidate = dir.path().join("cand.json");
        let primary = dir.path().join("rugguard_v2.json");
        let alias = dir.path().join("rugguard.json");
        fs::write(&candidate, b"new").unwrap();
        // reading a self-referencing symlink fails with ELOOP, not NotFound
        std::os::unix::fs::symlink(&primary, &primary).unwrap();
        fs::create_dir(&alias).unwrap();
        fs::write(alias.join("keep"), b"x").unwrap();

        let err = Promoter::new()
            .promote(&candidate, &digest_of(&candidate), &primary, Some(&alias))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("promote_write_failed:read"));
        assert!(fs::symlink_metadata(&primary).unwrap().file_type().is_symlink());
        assert!(tmp_files(dir.path()).is_empty());
    }
}
