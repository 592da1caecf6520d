//! Timeline integrity verification.
//!
//! Rehashes every commit reachable from HEAD, checks the parent chain,
//! resolves every table ref through its manifest, and re-verifies each
//! referenced stripe blob. Walking stops at the first divergence, which is
//! reported as a commit id plus the offending field; the offending blob is
//! quarantined so readers refuse it until repaired.

use varve_store::{parse_stripe, set_key, stripe_key, CommitId, StripeSet};

use super::{commit_key, Commit, Quarantine, Timeline};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyIssue {
    pub commit: CommitId,
    pub field: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub commits_checked: usize,
    pub stripes_checked: usize,
    pub first_divergence: Option<VerifyIssue>,
}

impl VerifyReport {
    pub fn ok(&self) -> bool {
        self.first_divergence.is_none()
    }
}

/// Verify everything reachable from HEAD.
pub fn verify(timeline: &Timeline, quarantine: &Quarantine) -> Result<VerifyReport> {
    let mut report =
        VerifyReport { commits_checked: 0, stripes_checked: 0, first_divergence: None };

    let Some(head) = timeline.head()? else {
        return Ok(report);
    };

    let mut next = Some(head);
    while let Some(id) = next.take() {
        if id.is_zero() {
            break;
        }
        let key = commit_key(&id);
        let Ok(raw) = timeline.store().get(&key) else {
            report.first_divergence = Some(VerifyIssue {
                commit: id,
                field: "record".to_string(),
                detail: "commit blob missing".to_string(),
            });
            break;
        };
        let commit = match Commit::decode(&raw) {
            Ok(c) => c,
            Err(e) => {
                quarantine.mark(&key, "commit record corrupt");
                report.first_divergence = Some(VerifyIssue {
                    commit: id,
                    field: "record".to_string(),
                    detail: e.to_string(),
                });
                break;
            }
        };
        report.commits_checked += 1;

        if commit.id != id {
            quarantine.mark(&key, "commit id mismatch");
            report.first_divergence = Some(VerifyIssue {
                commit: id,
                field: "id".to_string(),
                detail: format!("record hashes to {}", commit.id.short()),
            });
            break;
        }
        if let Err(field) = commit.verify_hashes() {
            quarantine.mark(&key, "commit hash mismatch");
            report.first_divergence = Some(VerifyIssue {
                commit: id,
                field: field.to_string(),
                detail: "rehash differs".to_string(),
            });
            break;
        }
        if !commit.is_genesis() && !timeline.store().exists(&commit_key(&commit.parent))? {
            report.first_divergence = Some(VerifyIssue {
                commit: id,
                field: "parent_id".to_string(),
                detail: format!("parent {} missing", commit.parent.short()),
            });
            break;
        }

        if let Some(issue) = verify_table_refs(timeline, quarantine, &commit, &mut report)? {
            report.first_divergence = Some(issue);
            break;
        }

        next = Some(commit.parent);
    }

    Ok(report)
}

fn verify_table_refs(
    timeline: &Timeline,
    quarantine: &Quarantine,
    commit: &Commit,
    report: &mut VerifyReport,
) -> Result<Option<VerifyIssue>> {
    for r in &commit.table_refs {
        if r.stripe_set_hash.is_zero() {
            continue;
        }
        let manifest_key = set_key(&r.table, &r.stripe_set_hash);
        let set: StripeSet = match timeline
            .store()
            .get(&manifest_key)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(set) => set,
            None => {
                quarantine.mark(&manifest_key, "manifest missing or malformed");
                return Ok(Some(VerifyIssue {
                    commit: commit.id,
                    field: format!("table_refs/{}", r.table),
                    detail: "manifest missing or malformed".to_string(),
                }));
            }
        };
        if set.merkle_root() != r.stripe_set_hash {
            quarantine.mark(&manifest_key, "manifest root mismatch");
            return Ok(Some(VerifyIssue {
                commit: commit.id,
                field: format!("table_refs/{}", r.table),
                detail: "manifest root does not match stripe_set_hash".to_string(),
            }));
        }
        for stripe in &set.stripes {
            let key = stripe_key(&r.table, stripe);
            let bytes = match timeline.store().get(&key) {
                Ok(bytes) => bytes,
                Err(_) => {
                    quarantine.mark(&key, "stripe blob missing");
                    return Ok(Some(VerifyIssue {
                        commit: commit.id,
                        field: format!("table_refs/{}/stripe/{}", r.table, stripe.short()),
                        detail: "stripe blob missing".to_string(),
                    }));
                }
            };
            if let Err(e) = parse_stripe(&bytes, Some(stripe)) {
                quarantine.mark(&key, "stripe corrupt");
                return Ok(Some(VerifyIssue {
                    commit: commit.id,
                    field: format!("table_refs/{}/stripe/{}", r.table, stripe.short()),
                    detail: e.to_string(),
                }));
            }
            report.stripes_checked += 1;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use varve_store::{
        encode_stripe, BlobStore, ColumnDef, DataType, Datum, Hash256, MemBlobStore,
        StripeOptions, StripeSet, TableDef,
    };

    use super::super::{TableRef, Timeline};
    use super::*;

    fn setup() -> (Arc<dyn BlobStore>, Timeline) {
        let store: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new());
        let tl = Timeline::open(Arc::clone(&store), 3, 1);
        (store, tl)
    }

    fn commit_one_stripe(store: &Arc<dyn BlobStore>, tl: &Timeline) -> (CommitId, String) {
        let table = TableDef::new("t", vec![ColumnDef::new("id", DataType::Int, false)]);
        let rows: Vec<Vec<Datum>> = (0..10).map(|i| vec![Datum::Int(i)]).collect();
        let enc = encode_stripe(&table, &rows, &StripeOptions::default()).unwrap();
        let key = stripe_key("t", &enc.id);
        store.put(&key, &enc.bytes).unwrap();
        let set = StripeSet::new(vec![enc.id]);
        let root = tl.put_manifest("t", &set).unwrap();
        let c = tl
            .append("t", "insert", vec![TableRef { table: "t".into(), stripe_set_hash: root }])
            .unwrap();
        (c, key)
    }

    #[test]
    fn clean_timeline_verifies() {
        let (store, tl) = setup();
        commit_one_stripe(&store, &tl);
        let report = verify(&tl, &Quarantine::new()).unwrap();
        assert!(report.ok());
        assert_eq!(report.commits_checked, 1);
        assert_eq!(report.stripes_checked, 1);
    }

    #[test]
    fn empty_timeline_verifies() {
        let (_store, tl) = setup();
        let report = verify(&tl, &Quarantine::new()).unwrap();
        assert!(report.ok());
        assert_eq!(report.commits_checked, 0);
    }

    #[test]
    fn corrupt_stripe_is_first_divergence_and_quarantined() {
        let (store, tl) = setup();
        let (commit, stripe_blob_key) = commit_one_stripe(&store, &tl);

        let mut bytes = store.get(&stripe_blob_key).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        store.put(&stripe_blob_key, &bytes).unwrap();

        let quarantine = Quarantine::new();
        let report = verify(&tl, &quarantine).unwrap();
        assert!(!report.ok());
        let issue = report.first_divergence.unwrap();
        assert_eq!(issue.commit, commit);
        assert!(issue.field.contains("stripe"));
        assert!(quarantine.is_marked(&stripe_blob_key));
    }

    #[test]
    fn tampered_commit_record_detected() {
        let (store, tl) = setup();
        let (commit, _) = commit_one_stripe(&store, &tl);
        let key = commit_key(&commit);
        let mut bytes = store.get(&key).unwrap();
        bytes[10] ^= 0x01;
        store.put(&key, &bytes).unwrap();

        let report = verify(&tl, &Quarantine::new()).unwrap();
        let issue = report.first_divergence.unwrap();
        assert_eq!(issue.commit, commit);
        assert_eq!(issue.field, "record");
    }

    #[test]
    fn missing_manifest_detected() {
        let (store, tl) = setup();
        let root = Hash256::compute(b"never-written");
        tl.append("t", "insert", vec![TableRef { table: "t".into(), stripe_set_hash: root }])
            .unwrap();
        let report = verify(&tl, &Quarantine::new()).unwrap();
        let issue = report.first_divergence.unwrap();
        assert_eq!(issue.field, "table_refs/t");
        let _ = store;
    }
}
