use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::config::HubConfig;
use crate::types::status::StepStatus;
use crate::types::step::Step;

const STEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exclusive claim on a `working` step. Expiry reverts the step to `queued`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Lease {
    pub worker: String,
    pub deadline_ms: u64,
}

/// A step plus everything the hub tracks about it. This is the unit of
/// persistence: one JSON document per step id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_trace: Option<String>,
    /// Submission order; breaks priority ties.
    pub seq: u64,
    /// Number of parents not currently in `success`.
    pub pending_parents: u32,
    pub lease: Option<Lease>,
    /// Earliest re-queue time while `pending`.
    pub not_before_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ScopeStats {
    pub queued: u64,
    pub working: u64,
    pub success: u64,
    pub pending: u64,
    pub cancel: u64,
    pub error: u64,
}

#[derive(Clone, Debug)]
pub struct HubStoreConfig {
    /// Ready steps leased per `get_steps` call.
    pub batch_size: usize,
    /// Deferral applied by a `pending` transition.
    pub pending_delay: Duration,
    /// Lease floor; the effective lease is `max(step.timeout, this)`.
    pub default_lease: Duration,
}

impl From<&HubConfig> for HubStoreConfig {
    fn from(cfg: &HubConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            pending_delay: cfg.pending_delay,
            default_lease: cfg.default_lease,
        }
    }
}

/// The step-state store. Every record lives in redb and is committed before
/// the mutating call returns; the scheduling indexes (per-scope ready
/// queues, lease deadlines, deferral deadlines, child adjacency) are
/// in-memory and rebuilt from the table on startup.
pub struct HubStore {
    db: Database,
    cfg: HubStoreConfig,
    next_seq: u64,
    records: HashMap<String, StepRecord>,
    /// scope -> (priority, seq) -> id, holding only dispatchable steps.
    ready: HashMap<String, BTreeMap<(i64, u64), String>>,
    /// (lease deadline, id) of `working` steps.
    working: BTreeSet<(u64, String)>,
    /// (not-before, id) of `pending` steps.
    deferred: BTreeSet<(u64, String)>,
    children: HashMap<String, Vec<String>>,
}

impl HubStore {
    pub fn open(path: &Path, cfg: HubStoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if parent != Path::new("") {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let db = Database::create(path)
            .with_context(|| format!("opening {}", path.display()))?;

        // Make sure the table exists before the first read.
        let txn = db.begin_write()?;
        txn.open_table(STEPS)?;
        txn.commit()?;

        let mut store = Self {
            db,
            cfg,
            next_seq: 0,
            records: HashMap::new(),
            ready: HashMap::new(),
            working: BTreeSet::new(),
            deferred: BTreeSet::new(),
            children: HashMap::new(),
        };
        store.load()?;

        Ok(store)
    }

    fn load(&mut self) -> Result<()> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STEPS)?;

        for entry in table.iter()? {
            let (key, value) = entry?;
            let record: StepRecord = serde_json::from_slice(value.value())
                .with_context(|| format!("corrupt record {}", key.value()))?;
            self.records.insert(key.value().to_string(), record);
        }

        let now = now_ms();
        for (id, record) in &self.records {
            self.next_seq = self.next_seq.max(record.seq + 1);

            for parent in &record.step.parents {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(id.clone());
            }

            match record.status {
                StepStatus::Queued if record.pending_parents == 0 => {
                    self.ready
                        .entry(record.step.scope.clone())
                        .or_default()
                        .insert((record.step.priority, record.seq), id.clone());
                },
                StepStatus::Working => {
                    let deadline = record
                        .lease
                        .as_ref()
                        .map(|l| l.deadline_ms)
                        .unwrap_or(now);
                    self.working.insert((deadline, id.clone()));
                },
                StepStatus::Pending => {
                    self.deferred.insert((
                        record.not_before_ms.unwrap_or(now),
                        id.clone(),
                    ));
                },
                _ => {},
            }
        }

        Ok(())
    }

    /// Commits the named records in one write transaction.
    fn persist(&self, ids: &BTreeSet<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(STEPS)?;
            for id in ids {
                let record = self
                    .records
                    .get(id)
                    .with_context(|| format!("missing record {id}"))?;
                let value = serde_json::to_vec(record)?;
                table.insert(id.as_str(), value.as_slice())?;
            }
        }
        txn.commit()?;

        Ok(())
    }

    fn drop_from_indexes(&mut self, id: &str) {
        let Some(record) = self.records.get(id) else {
            return;
        };

        match record.status {
            StepStatus::Queued => {
                if let Some(q) = self.ready.get_mut(&record.step.scope) {
                    q.remove(&(record.step.priority, record.seq));
                }
            },
            StepStatus::Working => {
                if let Some(lease) = &record.lease {
                    self.working.remove(&(lease.deadline_ms, id.to_string()));
                }
            },
            StepStatus::Pending => {
                if let Some(t) = record.not_before_ms {
                    self.deferred.remove(&(t, id.to_string()));
                }
            },
            _ => {},
        }
    }

    fn push_ready_if_dispatchable(&mut self, id: &str) {
        let Some(record) = self.records.get(id) else {
            return;
        };
        if record.status == StepStatus::Queued && record.pending_parents == 0 {
            self.ready
                .entry(record.step.scope.clone())
                .or_default()
                .insert((record.step.priority, record.seq), id.to_string());
        }
    }

    /// Inserts a whole DAG atomically. Rejects duplicate ids, ids already
    /// submitted, parent references to unknown steps, and cycles; on
    /// rejection nothing is stored.
    pub fn submit(&mut self, steps: Vec<Step>) -> Result<()> {
        let mut in_batch: HashMap<&str, &Step> = HashMap::new();
        for step in &steps {
            if step.id.is_empty() {
                bail!("step with empty id");
            }
            if self.records.contains_key(&step.id) {
                bail!("step {} already exists", step.id);
            }
            if in_batch.insert(step.id.as_str(), step).is_some() {
                bail!("duplicate step id {} in submission", step.id);
            }
        }

        for step in &steps {
            for parent in &step.parents {
                if !in_batch.contains_key(parent.as_str())
                    && !self.records.contains_key(parent)
                {
                    bail!("step {} references unknown parent {parent}", step.id);
                }
            }
        }

        // Kahn's algorithm over in-batch edges; anything left over is on a
        // cycle.
        let mut degree: HashMap<&str, usize> = HashMap::new();
        for step in &steps {
            let in_batch_parents = step
                .parents
                .iter()
                .filter(|p| in_batch.contains_key(p.as_str()))
                .count();
            degree.insert(step.id.as_str(), in_batch_parents);
        }
        let mut frontier: VecDeque<&str> = degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = frontier.pop_front() {
            visited += 1;
            for step in &steps {
                // a parent may be consumed more than once
                let edges =
                    step.parents.iter().filter(|p| p.as_str() == id).count();
                if edges > 0 {
                    let d = degree.get_mut(step.id.as_str()).unwrap();
                    *d -= edges;
                    if *d == 0 {
                        frontier.push_back(step.id.as_str());
                    }
                }
            }
        }
        if visited != steps.len() {
            bail!("submission contains a cycle");
        }

        let mut changed = BTreeSet::new();
        for step in steps {
            let pending_parents = step
                .parents
                .iter()
                .filter(|p| {
                    self.records
                        .get(*p)
                        .map(|r| r.status != StepStatus::Success)
                        // in-batch parents are queued, therefore not success
                        .unwrap_or(true)
                })
                .count() as u32;

            for parent in &step.parents {
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(step.id.clone());
            }

            let id = step.id.clone();
            let record = StepRecord {
                step,
                status: StepStatus::Queued,
                attempts: 0,
                last_error: None,
                last_trace: None,
                seq: self.next_seq,
                pending_parents,
                lease: None,
                not_before_ms: None,
            };
            self.next_seq += 1;

            self.records.insert(id.clone(), record);
            self.push_ready_if_dispatchable(&id);
            changed.insert(id);
        }

        self.persist(&changed)
    }

    /// Reverts expired leases and due deferrals to `queued`.
    pub fn reap(&mut self, now: u64) -> Result<()> {
        let mut changed = BTreeSet::new();

        while let Some((deadline, id)) = self.working.first().cloned() {
            if deadline > now {
                break;
            }
            self.working.remove(&(deadline, id.clone()));
            if let Some(record) = self.records.get_mut(&id) {
                record.status = StepStatus::Queued;
                record.lease = None;
                tracing::info!(%id, "lease expired; step re-queued");
            }
            self.push_ready_if_dispatchable(&id);
            changed.insert(id);
        }

        while let Some((not_before, id)) = self.deferred.first().cloned() {
            if not_before > now {
                break;
            }
            self.deferred.remove(&(not_before, id.clone()));
            if let Some(record) = self.records.get_mut(&id) {
                record.status = StepStatus::Queued;
                record.not_before_ms = None;
            }
            self.push_ready_if_dispatchable(&id);
            changed.insert(id);
        }

        self.persist(&changed)
    }

    /// Leases up to a batch of ready steps from the first non-empty scope in
    /// `scopes`, in priority order (reversed when `reverse`), and marks them
    /// `working`.
    pub fn get_steps(
        &mut self,
        scopes: &[String],
        reverse: bool,
        worker: &str,
    ) -> Result<Vec<String>> {
        let now = now_ms();
        self.reap(now)?;

        let mut picked = Vec::new();
        for scope in scopes {
            let Some(queue) = self.ready.get_mut(scope) else {
                continue;
            };
            if queue.is_empty() {
                continue;
            }

            let keys: Vec<(i64, u64)> = if reverse {
                queue.keys().rev().take(self.cfg.batch_size).cloned().collect()
            } else {
                queue.keys().take(self.cfg.batch_size).cloned().collect()
            };
            for key in keys {
                if let Some(id) = queue.remove(&key) {
                    picked.push(id);
                }
            }
            break;
        }

        let mut changed = BTreeSet::new();
        for id in &picked {
            // Panic safety: picked ids came straight out of the ready index,
            // which only ever holds ids present in records.
            let record = self.records.get_mut(id).unwrap();
            let lease_ms = (record.step.timeout_or(0) * 1000)
                .max(self.cfg.default_lease.as_millis() as u64);
            record.status = StepStatus::Working;
            record.lease = Some(Lease {
                worker: worker.to_string(),
                deadline_ms: now + lease_ms,
            });
            self.working.insert((now + lease_ms, id.clone()));
            changed.insert(id.clone());
        }
        self.persist(&changed)?;

        Ok(picked)
    }

    pub fn get_step(&self, id: &str) -> Option<StepRecord> {
        self.records.get(id).cloned()
    }

    pub fn bulk_get_step(&self, ids: &[String]) -> BTreeMap<String, StepRecord> {
        ids.iter()
            .filter_map(|id| {
                self.records.get(id).map(|r| (id.clone(), r.clone()))
            })
            .collect()
    }

    pub fn done(&mut self, id: &str) -> Result<()> {
        self.dones(std::slice::from_ref(&id.to_string()))
    }

    /// Marks steps `success` and unblocks any children whose last
    /// outstanding parent this was. Already-successful ids are no-ops.
    pub fn dones(&mut self, ids: &[String]) -> Result<()> {
        let mut changed = BTreeSet::new();

        for id in ids {
            if !self.records.contains_key(id) {
                tracing::warn!(%id, "done for unknown step");
                continue;
            }
            if self.records[id].status == StepStatus::Success {
                continue;
            }

            self.drop_from_indexes(id);
            {
                let record = self.records.get_mut(id).unwrap();
                record.status = StepStatus::Success;
                record.lease = None;
                record.not_before_ms = None;
            }
            changed.insert(id.clone());

            for child in self.children.get(id).cloned().unwrap_or_default() {
                if let Some(child_rec) = self.records.get_mut(&child) {
                    child_rec.pending_parents =
                        child_rec.pending_parents.saturating_sub(1);
                    self.push_ready_if_dispatchable(&child);
                    changed.insert(child);
                }
            }
        }

        self.persist(&changed)
    }

    pub fn pending(&mut self, id: &str) -> Result<()> {
        self.pendings(std::slice::from_ref(&id.to_string()))
    }

    /// Defers steps that chose to wait; they re-enter `queued` once the
    /// configured delay passes.
    pub fn pendings(&mut self, ids: &[String]) -> Result<()> {
        let now = now_ms();
        let not_before = now + self.cfg.pending_delay.as_millis() as u64;
        let mut changed = BTreeSet::new();

        for id in ids {
            if !self.records.contains_key(id) {
                tracing::warn!(%id, "pending for unknown step");
                continue;
            }
            if self.records[id].status == StepStatus::Pending {
                continue;
            }

            self.drop_from_indexes(id);
            {
                let record = self.records.get_mut(id).unwrap();
                record.status = StepStatus::Pending;
                record.lease = None;
                record.not_before_ms = Some(not_before);
            }
            self.deferred.insert((not_before, id.clone()));
            changed.insert(id.clone());
        }

        self.persist(&changed)
    }

    pub fn reset(&mut self, id: &str) -> Result<()> {
        self.resets(std::slice::from_ref(&id.to_string()))
    }

    /// Returns steps to `queued` immediately, clearing accumulated failure
    /// state. Resetting a `success` step re-blocks its children.
    pub fn resets(&mut self, ids: &[String]) -> Result<()> {
        let mut changed = BTreeSet::new();

        for id in ids {
            if !self.records.contains_key(id) {
                tracing::warn!(%id, "reset for unknown step");
                continue;
            }

            let was_success = self.records[id].status == StepStatus::Success;
            self.drop_from_indexes(id);
            {
                let record = self.records.get_mut(id).unwrap();
                record.status = StepStatus::Queued;
                record.attempts = 0;
                record.last_error = None;
                record.last_trace = None;
                record.lease = None;
                record.not_before_ms = None;
            }
            changed.insert(id.clone());

            if was_success {
                for child in
                    self.children.get(id).cloned().unwrap_or_default()
                {
                    if let Some(child_rec) = self.records.get_mut(&child) {
                        child_rec.pending_parents += 1;
                    }
                    self.drop_from_ready(&child);
                    changed.insert(child);
                }
            }

            self.push_ready_if_dispatchable(id);
        }

        self.persist(&changed)
    }

    fn drop_from_ready(&mut self, id: &str) {
        if let Some(record) = self.records.get(id) {
            if record.status == StepStatus::Queued {
                if let Some(q) = self.ready.get_mut(&record.step.scope) {
                    q.remove(&(record.step.priority, record.seq));
                }
            }
        }
    }

    pub fn cancel(&mut self, id: &str) -> Result<()> {
        self.cancels(std::slice::from_ref(&id.to_string()))
    }

    /// Cancels steps and all their transitive descendants.
    pub fn cancels(&mut self, ids: &[String]) -> Result<()> {
        let mut changed = BTreeSet::new();
        let mut frontier: VecDeque<String> = ids.to_vec().into();

        while let Some(id) = frontier.pop_front() {
            if !self.records.contains_key(&id) {
                tracing::warn!(%id, "cancel for unknown step");
                continue;
            }
            if changed.contains(&id)
                || self.records[&id].status == StepStatus::Cancel
            {
                continue;
            }

            self.drop_from_indexes(&id);
            {
                let record = self.records.get_mut(&id).unwrap();
                record.status = StepStatus::Cancel;
                record.lease = None;
                record.not_before_ms = None;
            }
            changed.insert(id.clone());

            for child in self.children.get(&id).cloned().unwrap_or_default() {
                frontier.push_back(child);
            }
        }

        self.persist(&changed)
    }

    /// Records a failed run: message and trace are kept, `attempts` grows,
    /// and the step parks in `error` until an operator reset. A step already
    /// in `error` is left untouched.
    pub fn error(&mut self, id: &str, message: &str, trace: &str) -> Result<()> {
        if !self.records.contains_key(id) {
            tracing::warn!(%id, "error for unknown step");
            return Ok(());
        }
        if self.records[id].status == StepStatus::Error {
            return Ok(());
        }

        self.drop_from_indexes(id);
        {
            let record = self.records.get_mut(id).unwrap();
            record.status = StepStatus::Error;
            record.attempts += 1;
            record.last_error = Some(message.to_string());
            record.last_trace = Some(trace.to_string());
            record.lease = None;
            record.not_before_ms = None;
        }

        self.persist(&BTreeSet::from([id.to_string()]))
    }

    /// Per-scope counts by status.
    pub fn stats(&self) -> BTreeMap<String, ScopeStats> {
        let mut out: BTreeMap<String, ScopeStats> = BTreeMap::new();
        for record in self.records.values() {
            let entry = out.entry(record.step.scope.clone()).or_default();
            match record.status {
                StepStatus::Queued | StepStatus::Reset => entry.queued += 1,
                StepStatus::Working => entry.working += 1,
                StepStatus::Success => entry.success += 1,
                StepStatus::Pending => entry.pending += 1,
                StepStatus::Cancel => entry.cancel += 1,
                StepStatus::Error => entry.error += 1,
            }
        }
        out
    }
}
