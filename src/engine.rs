use crate::rank::{recompute_derived, rerank_group, GroupKey, RankPolicy, ResultRecord, SubjectIssue};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Persistence collaborator for result records. The engine owns the rank
/// computation, not the record lifetime; all reads and writes go through
/// this trait.
pub trait ResultStore {
    /// Members of one peer group, in a stable order (insertion order) so the
    /// stable tie-break is reproducible across calls.
    fn find_by_group(&self, key: &GroupKey) -> Result<Vec<ResultRecord>, StoreError>;
    fn find_by_id(&self, id: &str) -> Result<Option<ResultRecord>, StoreError>;
    fn save(&self, record: &ResultRecord) -> Result<(), StoreError>;
    fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailure {
    pub id: String,
    pub message: String,
}

#[derive(Debug)]
pub enum EngineError {
    /// Rejected before any computation or I/O.
    Validation { message: String },
    NotFound { id: String },
    /// The incoming natural key already belongs to a different record.
    Conflict { message: String },
    /// A store read (or the delete itself) failed; nothing was written.
    Store { message: String },
    /// Some peer writes landed and some did not. `written` lists every id
    /// known to be persisted so a retry can be targeted.
    PartialWrite {
        written: Vec<String>,
        failed: Vec<WriteFailure>,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation { message } => write!(f, "validation: {}", message),
            EngineError::NotFound { id } => write!(f, "result not found: {}", id),
            EngineError::Conflict { message } => write!(f, "conflict: {}", message),
            EngineError::Store { message } => write!(f, "store: {}", message),
            EngineError::PartialWrite { written, failed } => write!(
                f,
                "partial write: {} persisted, {} failed",
                written.len(),
                failed.len()
            ),
        }
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    /// The incoming record with fresh derived fields and rank.
    pub record: ResultRecord,
    /// Ids persisted by this call (the incoming record plus changed peers).
    pub written: Vec<String>,
    pub issues: Vec<SubjectIssue>,
}

#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub deleted: ResultRecord,
    pub written: Vec<String>,
}

/// Maintains the invariant that every member of a peer group carries the
/// rank of its position under (percent desc, total desc).
///
/// Concurrent saves or deletes that touch the same group are serialized with
/// a per-group mutex held across fetch, rerank, and write-back; calls on
/// different groups do not contend.
pub struct RankEngine {
    // One entry per group key ever touched; entries are never evicted. The
    // map is bounded by the number of distinct (class, section, term)
    // triples in the workspace.
    locks: Mutex<HashMap<GroupKey, Arc<Mutex<()>>>>,
}

impl Default for RankEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RankEngine {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn group_lock(&self, key: &GroupKey) -> Arc<Mutex<()>> {
        let mut locks = lock_unpoisoned(&self.locks);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Recompute the incoming record's derived fields, rerank its peer
    /// group, and persist the record plus every peer whose rank changed.
    ///
    /// One fetch, one in-memory rerank, one batch write; a write never
    /// re-triggers the computation. Idempotent: repeating the call with the
    /// same input leaves ranks unchanged.
    pub fn on_save<S: ResultStore>(
        &self,
        store: &S,
        mut record: ResultRecord,
        policy: &RankPolicy,
    ) -> Result<SaveOutcome, EngineError> {
        validate(&record)?;
        let issues = recompute_derived(&mut record, policy);

        let key = record.group_key();
        let lock = self.group_lock(&key);
        let _group = lock_unpoisoned(&lock);

        let peers = store
            .find_by_group(&key)
            .map_err(|e| EngineError::Store { message: e.message })?;

        // A natural-key match under a different surrogate id is either the
        // same record being upserted without its id, or an identified record
        // trying to take over another record's roll number. Adopt the stored
        // id only in the first case; the second is a conflict, never a
        // silent redirect.
        if let Some(existing) = peers
            .iter()
            .find(|p| p.id != record.id && p.same_identity(&record))
        {
            let existing_id = existing.id.clone();
            let incoming_is_stored = peers.iter().any(|p| p.id == record.id)
                || store
                    .find_by_id(&record.id)
                    .map_err(|e| EngineError::Store { message: e.message })?
                    .is_some();
            if incoming_is_stored {
                return Err(EngineError::Conflict {
                    message: format!(
                        "roll number {} already belongs to another record in this group",
                        record.roll_number
                    ),
                });
            }
            record.id = existing_id;
        }

        // Merge the incoming record into the peer snapshot in place of any
        // previous version of itself, keeping the snapshot order intact for
        // the stable tie-break.
        let mut members: Vec<ResultRecord> = Vec::with_capacity(peers.len() + 1);
        let mut replaced = false;
        for peer in peers {
            if peer.id == record.id {
                members.push(record.clone());
                replaced = true;
            } else {
                members.push(peer);
            }
        }
        if !replaced {
            members.push(record.clone());
        }

        let prior_ranks: HashMap<String, i64> = members
            .iter()
            .filter(|m| m.id != record.id)
            .map(|m| (m.id.clone(), m.rank))
            .collect();

        let ranked = rerank_group(policy, members);

        let mut written: Vec<String> = Vec::new();
        let mut failed: Vec<WriteFailure> = Vec::new();
        let mut saved_record: Option<ResultRecord> = None;

        for member in &ranked {
            let is_incoming = member.id == record.id;
            let rank_changed = prior_ranks.get(&member.id).map(|r| *r != member.rank);
            if !is_incoming && rank_changed != Some(true) {
                continue;
            }
            match store.save(member) {
                Ok(()) => written.push(member.id.clone()),
                Err(e) => failed.push(WriteFailure {
                    id: member.id.clone(),
                    message: e.message,
                }),
            }
            if is_incoming {
                saved_record = Some(member.clone());
            }
        }

        if !failed.is_empty() {
            return Err(EngineError::PartialWrite { written, failed });
        }

        Ok(SaveOutcome {
            record: saved_record.unwrap_or(record),
            written,
            issues,
        })
    }

    /// Remove a record and rerank the group it leaves behind.
    pub fn on_delete<S: ResultStore>(
        &self,
        store: &S,
        id: &str,
        policy: &RankPolicy,
    ) -> Result<DeleteOutcome, EngineError> {
        let deleted = store
            .find_by_id(id)
            .map_err(|e| EngineError::Store { message: e.message })?
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;

        let key = deleted.group_key();
        let lock = self.group_lock(&key);
        let _group = lock_unpoisoned(&lock);

        store
            .delete_by_id(id)
            .map_err(|e| EngineError::Store { message: e.message })?;

        let remaining = store
            .find_by_group(&key)
            .map_err(|e| EngineError::Store { message: e.message })?;

        let prior_ranks: HashMap<String, i64> = remaining
            .iter()
            .map(|m| (m.id.clone(), m.rank))
            .collect();

        let ranked = rerank_group(policy, remaining);

        let mut written: Vec<String> = Vec::new();
        let mut failed: Vec<WriteFailure> = Vec::new();
        for member in &ranked {
            if prior_ranks.get(&member.id) == Some(&member.rank) {
                continue;
            }
            match store.save(member) {
                Ok(()) => written.push(member.id.clone()),
                Err(e) => failed.push(WriteFailure {
                    id: member.id.clone(),
                    message: e.message,
                }),
            }
        }

        if !failed.is_empty() {
            return Err(EngineError::PartialWrite { written, failed });
        }

        Ok(DeleteOutcome { deleted, written })
    }
}

fn validate(record: &ResultRecord) -> Result<(), EngineError> {
    let required = [
        ("name", &record.name),
        ("rollNumber", &record.roll_number),
        ("class", &record.class),
        ("section", &record.section),
        ("examTerm", &record.exam_term),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(EngineError::Validation {
                message: format!("missing {}", field),
            });
        }
    }
    if record.subjects.is_empty() {
        return Err(EngineError::Validation {
            message: "subjects must not be empty".to_string(),
        });
    }
    Ok(())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
