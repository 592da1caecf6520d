//! The Merkle timeline: an append-only, hash-chained commit log.
//!
//! State on disk:
//! - `refs/HEAD`: hex id of the current tip
//! - `refs/snapshots/<name>`: named immutable commit references
//! - `commits/<id>`: binary commit records
//! - `stripes/<table>/sets/<hash>`: stripe-set manifests resolving a
//!   commit's `stripe_set_hash` to the ordered stripe list
//!
//! HEAD is the only mutable reference besides snapshots. Appends hold the
//! single-writer lock; readers never take it.

pub mod commit;
pub mod diff;
pub mod verify;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use varve_store::{set_key, BlobStore, CommitId, Hash256, StorageError, StripeSet};

use crate::error::{EngineError, Result};
use crate::obs;

pub use commit::{Commit, TableRef};
pub use diff::TableChange;
pub use verify::{VerifyIssue, VerifyReport};

pub const HEAD_KEY: &str = "refs/HEAD";
pub const SNAPSHOT_PREFIX: &str = "refs/snapshots/";
pub const COMMIT_PREFIX: &str = "commits/";

fn commit_key(id: &CommitId) -> String {
    format!("{COMMIT_PREFIX}{}", id.to_hex())
}

fn snapshot_key(name: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{name}")
}

/// Blob keys that failed integrity checks. Readers refuse them until the
/// blob is repaired and the mark cleared.
#[derive(Default, Clone)]
pub struct Quarantine {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, key: &str, detail: &str) {
        obs::emit_integrity_quarantined(key, detail);
        self.inner.write().insert(key.to_string());
    }

    pub fn is_marked(&self, key: &str) -> bool {
        self.inner.read().contains(key)
    }

    pub fn clear(&self, key: &str) {
        self.inner.write().remove(key);
    }

    pub fn marked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// Result of a garbage-collection sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub commits_removed: usize,
    pub manifests_removed: usize,
    pub stripes_removed: usize,
}

pub struct Timeline {
    store: Arc<dyn BlobStore>,
    /// Single-writer lock over HEAD. Readers never acquire it.
    head_lock: Mutex<()>,
    append_retries: u32,
    append_backoff_ms: u64,
}

impl Timeline {
    pub fn open(store: Arc<dyn BlobStore>, append_retries: u32, append_backoff_ms: u64) -> Self {
        Self { store, head_lock: Mutex::new(()), append_retries, append_backoff_ms }
    }

    /// Current tip, or `None` before the first commit.
    pub fn head(&self) -> Result<Option<CommitId>> {
        match self.store.get(HEAD_KEY) {
            Ok(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| EngineError::Integrity("HEAD is not utf-8".to_string()))?;
                let id: CommitId = text
                    .trim()
                    .parse()
                    .map_err(|_| EngineError::Integrity("HEAD is not a commit id".to_string()))?;
                Ok(Some(id))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Commit> {
        let bytes = self.store.get(&commit_key(id))?;
        let commit = Commit::decode(&bytes)?;
        if &commit.id != id {
            return Err(EngineError::internal_invariant(
                "I1",
                format!("commit blob {} decodes to id {}", id.short(), commit.id.short()),
            ));
        }
        Ok(commit)
    }

    /// Append a commit for `operation` over `table_refs`.
    ///
    /// Single-writer: reads HEAD, builds and stages the record, then CAS
    /// updates HEAD under the writer lock. If HEAD moved in between, the
    /// append retries after a bounded backoff; this is the only retrying
    /// operation in the engine.
    pub fn append(
        &self,
        author: &str,
        operation: &str,
        table_refs: Vec<TableRef>,
    ) -> Result<CommitId> {
        let mut attempt = 0u32;
        loop {
            let observed = self.head()?.unwrap_or_else(Hash256::zero);
            let commit = Commit::build(
                observed,
                Utc::now().timestamp_micros(),
                author,
                operation,
                table_refs.clone(),
            );
            self.store.put(&commit_key(&commit.id), &commit.encode()?)?;

            let swapped = {
                let _writer = self.head_lock.lock();
                let current = self.head()?.unwrap_or_else(Hash256::zero);
                if current == observed {
                    self.store.put(HEAD_KEY, commit.id.to_hex().as_bytes())?;
                    true
                } else {
                    false
                }
            };
            if swapped {
                obs::emit_commit_appended(
                    &commit.id.short(),
                    &commit.parent.short(),
                    operation,
                    commit.table_refs.len(),
                );
                return Ok(commit.id);
            }

            attempt += 1;
            if attempt > self.append_retries {
                return Err(EngineError::ConcurrentWrite);
            }
            debug!(event = "commit.append_retry", attempt = attempt);
            std::thread::sleep(std::time::Duration::from_millis(
                self.append_backoff_ms * u64::from(attempt),
            ));
        }
    }

    /// Iterate the parent chain from `from` back to `to` (exclusive), or to
    /// genesis when `to` is `None`.
    pub fn walk(&self, from: CommitId, to: Option<CommitId>) -> Walk<'_> {
        Walk { timeline: self, next: Some(from), stop: to }
    }

    /// Resolve a symbolic or explicit reference: `HEAD`, a snapshot name, a
    /// full commit id, or a unique hex prefix of at least 6 chars.
    pub fn resolve(&self, reference: &str) -> Result<CommitId> {
        if reference.eq_ignore_ascii_case("head") {
            return self
                .head()?
                .ok_or_else(|| EngineError::Catalog("timeline has no commits yet".to_string()));
        }
        if let Ok(bytes) = self.store.get(&snapshot_key(reference)) {
            let text = String::from_utf8(bytes)
                .map_err(|_| EngineError::Integrity(format!("snapshot {reference} is not utf-8")))?;
            return text
                .trim()
                .parse()
                .map_err(|_| EngineError::Integrity(format!("snapshot {reference} is malformed")));
        }
        if reference.len() == 64 {
            if let Ok(id) = reference.parse::<CommitId>() {
                if self.store.exists(&commit_key(&id))? {
                    return Ok(id);
                }
            }
        }
        if reference.len() >= 6 && reference.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<String> = self
                .store
                .list(&format!("{COMMIT_PREFIX}{reference}"))?
                .into_iter()
                .collect();
            match matches.len() {
                1 => {
                    let hex = matches[0].trim_start_matches(COMMIT_PREFIX);
                    return hex
                        .parse()
                        .map_err(|_| EngineError::Integrity("malformed commit key".to_string()));
                }
                0 => {}
                _ => {
                    return Err(EngineError::Catalog(format!(
                        "ambiguous commit prefix {reference}"
                    )))
                }
            }
        }
        Err(EngineError::Catalog(format!("unknown reference {reference}")))
    }

    /// Create a named snapshot. Snapshots are immutable: creating over an
    /// existing name fails.
    pub fn snapshot(&self, name: &str, commit: CommitId) -> Result<()> {
        let key = snapshot_key(name);
        if self.store.exists(&key)? {
            return Err(EngineError::Constraint(format!("snapshot {name} already exists")));
        }
        if !self.store.exists(&commit_key(&commit))? {
            return Err(EngineError::Catalog(format!("unknown commit {}", commit.short())));
        }
        self.store.put(&key, commit.to_hex().as_bytes())?;
        info!(event = "snapshot.created", name = %name, commit = %commit.short());
        Ok(())
    }

    pub fn drop_snapshot(&self, name: &str) -> Result<()> {
        let key = snapshot_key(name);
        if !self.store.exists(&key)? {
            return Err(EngineError::Catalog(format!("unknown snapshot {name}")));
        }
        self.store.delete(&key)?;
        info!(event = "snapshot.dropped", name = %name);
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<(String, CommitId)>> {
        let mut out = Vec::new();
        for key in self.store.list(SNAPSHOT_PREFIX)? {
            let name = key.trim_start_matches(SNAPSHOT_PREFIX).to_string();
            let id = self.resolve(&name)?;
            out.push((name, id));
        }
        Ok(out)
    }

    /// Move HEAD back to an ancestor. Orphaned commits stay on disk until a
    /// `gc` pass.
    pub fn reset(&self, commit: CommitId) -> Result<()> {
        let head = self
            .head()?
            .ok_or_else(|| EngineError::Catalog("timeline has no commits yet".to_string()))?;
        let mut is_ancestor = false;
        for step in self.walk(head, None) {
            if step?.id == commit {
                is_ancestor = true;
                break;
            }
        }
        if !is_ancestor {
            return Err(EngineError::Catalog(format!(
                "{} is not an ancestor of HEAD",
                commit.short()
            )));
        }
        let _writer = self.head_lock.lock();
        self.store.put(HEAD_KEY, commit.to_hex().as_bytes())?;
        info!(event = "timeline.reset", head = %commit.short());
        Ok(())
    }

    /// Persist a stripe-set manifest and return its Merkle root.
    pub fn put_manifest(&self, table: &str, set: &StripeSet) -> Result<Hash256> {
        let root = set.merkle_root();
        let bytes = serde_json::to_vec(set)
            .map_err(|e| EngineError::Internal(format!("manifest encode: {e}")))?;
        self.store.put(&set_key(table, &root), &bytes)?;
        Ok(root)
    }

    pub fn get_manifest(&self, table: &str, set_hash: &Hash256) -> Result<StripeSet> {
        if set_hash.is_zero() {
            return Ok(StripeSet::default());
        }
        let bytes = self.store.get(&set_key(table, set_hash))?;
        let set: StripeSet = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Integrity(format!("manifest decode: {e}")))?;
        if &set.merkle_root() != set_hash {
            return Err(EngineError::internal_invariant(
                "I2",
                format!("manifest for {table}@{} has wrong root", set_hash.short()),
            ));
        }
        Ok(set)
    }

    /// The stripe set of `table` as observed from `commit`: the most recent
    /// ancestor ref that touched the table, or the empty set.
    pub fn table_state_at(&self, commit: CommitId, table: &str) -> Result<StripeSet> {
        for step in self.walk(commit, None) {
            let c = step?;
            if let Some(r) = c.table_ref(table) {
                return self.get_manifest(table, &r.stripe_set_hash);
            }
        }
        Ok(StripeSet::default())
    }

    /// The stripe-set root of `table` at `commit` without loading the
    /// manifest. Zero when the table was never committed.
    pub fn table_root_at(&self, commit: CommitId, table: &str) -> Result<Hash256> {
        for step in self.walk(commit, None) {
            let c = step?;
            if let Some(r) = c.table_ref(table) {
                return Ok(r.stripe_set_hash);
            }
        }
        Ok(Hash256::zero())
    }

    /// Latest refs of every table reachable from `commit`.
    pub fn full_state_at(&self, commit: CommitId) -> Result<BTreeMap<String, Hash256>> {
        let mut state = BTreeMap::new();
        for step in self.walk(commit, None) {
            let c = step?;
            for r in &c.table_refs {
                state.entry(r.table.clone()).or_insert(r.stripe_set_hash);
            }
        }
        Ok(state)
    }

    /// Sweep unreachable commits, manifests, and stripes. The reachability
    /// root is HEAD plus every named snapshot.
    pub fn gc(&self) -> Result<GcReport> {
        let mut roots = Vec::new();
        if let Some(head) = self.head()? {
            roots.push(head);
        }
        for (_, id) in self.list_snapshots()? {
            roots.push(id);
        }

        let mut live_commits: HashSet<CommitId> = HashSet::new();
        let mut live_blobs: HashSet<String> = HashSet::new();
        for root in roots {
            for step in self.walk(root, None) {
                let c = step?;
                if !live_commits.insert(c.id) {
                    break; // already swept this chain suffix
                }
                for r in &c.table_refs {
                    if r.stripe_set_hash.is_zero() {
                        continue;
                    }
                    live_blobs.insert(set_key(&r.table, &r.stripe_set_hash));
                    let set = self.get_manifest(&r.table, &r.stripe_set_hash)?;
                    for stripe in &set.stripes {
                        live_blobs.insert(varve_store::stripe_key(&r.table, stripe));
                    }
                }
            }
        }

        let mut report = GcReport::default();
        for key in self.store.list(COMMIT_PREFIX)? {
            let hex = key.trim_start_matches(COMMIT_PREFIX);
            let id: CommitId = match hex.parse() {
                Ok(id) => id,
                Err(_) => continue,
            };
            if !live_commits.contains(&id) {
                self.store.delete(&key)?;
                report.commits_removed += 1;
            }
        }
        for key in self.store.list("stripes/")? {
            if live_blobs.contains(&key) {
                continue;
            }
            if key.contains("/sets/") {
                report.manifests_removed += 1;
            } else {
                report.stripes_removed += 1;
            }
            self.store.delete(&key)?;
        }
        info!(
            event = "timeline.gc",
            commits_removed = report.commits_removed,
            stripes_removed = report.stripes_removed,
            manifests_removed = report.manifests_removed,
        );
        Ok(report)
    }

    pub(crate) fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }
}

/// Iterator over the parent chain.
pub struct Walk<'a> {
    timeline: &'a Timeline,
    next: Option<CommitId>,
    stop: Option<CommitId>,
}

impl Iterator for Walk<'_> {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        if id.is_zero() || Some(id) == self.stop {
            return None;
        }
        match self.timeline.get_commit(&id) {
            Ok(commit) => {
                self.next = Some(commit.parent);
                Some(Ok(commit))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varve_store::MemBlobStore;

    fn timeline() -> Timeline {
        let store: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
        Timeline::open(store, 3, 1)
    }

    fn table_ref(table: &str, tag: &[u8]) -> TableRef {
        TableRef { table: table.into(), stripe_set_hash: Hash256::compute(tag) }
    }

    #[test]
    fn append_advances_head_and_chains() {
        let tl = timeline();
        assert!(tl.head().unwrap().is_none());

        let c1 = tl.append("tester", "create table t", vec![table_ref("t", b"v1")]).unwrap();
        let c2 = tl.append("tester", "insert into t", vec![table_ref("t", b"v2")]).unwrap();

        assert_eq!(tl.head().unwrap(), Some(c2));
        let commit2 = tl.get_commit(&c2).unwrap();
        assert_eq!(commit2.parent, c1);
        let commit1 = tl.get_commit(&c1).unwrap();
        assert!(commit1.is_genesis());
    }

    #[test]
    fn walk_visits_newest_first() {
        let tl = timeline();
        let c1 = tl.append("t", "one", vec![]).unwrap();
        let c2 = tl.append("t", "two", vec![]).unwrap();
        let c3 = tl.append("t", "three", vec![]).unwrap();

        let ids: Vec<CommitId> =
            tl.walk(c3, None).map(|c| c.unwrap().id).collect();
        assert_eq!(ids, vec![c3, c2, c1]);

        let bounded: Vec<CommitId> =
            tl.walk(c3, Some(c1)).map(|c| c.unwrap().id).collect();
        assert_eq!(bounded, vec![c3, c2]);
    }

    #[test]
    fn snapshots_are_immutable_references() {
        let tl = timeline();
        let c1 = tl.append("t", "one", vec![]).unwrap();
        tl.snapshot("s1", c1).unwrap();
        assert_eq!(tl.resolve("s1").unwrap(), c1);
        assert!(tl.snapshot("s1", c1).is_err());
        tl.drop_snapshot("s1").unwrap();
        assert!(tl.resolve("s1").is_err());
        assert!(tl.drop_snapshot("s1").is_err());
    }

    #[test]
    fn resolve_head_full_id_and_prefix() {
        let tl = timeline();
        let c1 = tl.append("t", "one", vec![]).unwrap();
        assert_eq!(tl.resolve("HEAD").unwrap(), c1);
        assert_eq!(tl.resolve(&c1.to_hex()).unwrap(), c1);
        assert_eq!(tl.resolve(&c1.to_hex()[..8]).unwrap(), c1);
        assert!(tl.resolve("nonsense").is_err());
    }

    #[test]
    fn reset_requires_ancestry() {
        let tl = timeline();
        let c1 = tl.append("t", "one", vec![]).unwrap();
        let c2 = tl.append("t", "two", vec![]).unwrap();
        tl.reset(c1).unwrap();
        assert_eq!(tl.head().unwrap(), Some(c1));
        // c2 is now orphaned, not an ancestor.
        assert!(tl.reset(c2).is_err());
    }

    #[test]
    fn table_state_resolves_latest_touching_commit() {
        let tl = timeline();
        let set_v1 = StripeSet::new(vec![Hash256::compute(b"stripe-a")]);
        let root_v1 = tl.put_manifest("t", &set_v1).unwrap();
        let c1 = tl
            .append("t", "insert", vec![TableRef { table: "t".into(), stripe_set_hash: root_v1 }])
            .unwrap();
        let _c2 = tl.append("t", "touch other", vec![table_ref("u", b"other")]);

        let head = tl.head().unwrap().unwrap();
        assert_eq!(tl.table_state_at(head, "t").unwrap(), set_v1);
        assert_eq!(tl.table_root_at(head, "t").unwrap(), root_v1);
        assert_eq!(tl.table_state_at(c1, "missing").unwrap(), StripeSet::default());
        assert!(tl.table_root_at(head, "missing").unwrap().is_zero());
    }

    #[test]
    fn gc_keeps_snapshot_reachable_history() {
        let tl = timeline();
        let set = StripeSet::new(vec![Hash256::compute(b"keep-me")]);
        let root = tl.put_manifest("t", &set).unwrap();
        tl.store().put(&varve_store::stripe_key("t", &set.stripes[0]), b"stripe-bytes").unwrap();

        let c1 = tl
            .append("t", "insert", vec![TableRef { table: "t".into(), stripe_set_hash: root }])
            .unwrap();
        let c2 = tl.append("t", "noop", vec![]).unwrap();
        tl.snapshot("keep", c2).unwrap();
        tl.reset(c1).unwrap();

        // c2 is orphaned from HEAD but pinned by the snapshot.
        let report = tl.gc().unwrap();
        assert_eq!(report.commits_removed, 0);
        assert!(tl.get_commit(&c2).is_ok());

        tl.drop_snapshot("keep").unwrap();
        let report = tl.gc().unwrap();
        assert_eq!(report.commits_removed, 1);
        assert!(tl.get_commit(&c2).is_err());
        // Stripe referenced from HEAD history survives.
        assert!(tl.store().exists(&varve_store::stripe_key("t", &set.stripes[0])).unwrap());
    }

    #[test]
    fn quarantine_marks_and_clears() {
        let q = Quarantine::new();
        q.mark("stripes/t/abc", "hash mismatch");
        assert!(q.is_marked("stripes/t/abc"));
        assert_eq!(q.marked_keys(), vec!["stripes/t/abc".to_string()]);
        q.clear("stripes/t/abc");
        assert!(!q.is_marked("stripes/t/abc"));
    }
}
