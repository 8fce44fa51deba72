//! Persisted fact store backed by [`redb`], with the embedding and queue
//! tables that make up the rest of the memory pipeline's "Persistent state"
//! shape.
//!
//! Most tables live in one `redb` database file with `serde_json`-encoded
//! values — the codebase this grew out of already used `serde_json::to_vec`
//! for its redb-backed index despite documenting the table as "bincode", and
//! this keeps the on-disk format one well-understood encoding rather than
//! two. See DESIGN.md for the dependency note on `bincode`. The embeddings
//! table is the one exception: the vector itself is packed as raw
//! little-endian `f32` bytes via [`crate::vector::serialize_vector`] behind a
//! short `serde_json` header, so the on-disk float representation matches
//! what a non-Rust sibling implementation would produce rather than a JSON
//! number array.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::decay::{DECAY_SCAN_BATCH_SIZE, get_decay_status};
use crate::fact::{Domain, Fact, STALE_AGE_DAYS};
use crate::queue::{QueueRow, QueueStatus};
use crate::vector::{deserialize_vector, serialize_vector};

const FACTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("facts");
const EMBEDDINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("fact_embeddings");
const EXTRACTION_QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_extraction");
const EMBEDDING_QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_embedding");
const REMINDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("reminders");

/// `(factId, modelVersion) -> vector` — kept separate from `Fact` itself so
/// the embedding can be swapped out under a new model version without
/// touching the fact row.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub fact_id: Uuid,
    pub model_version: String,
    pub vector: Vec<f32>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct EmbeddingHeader {
    fact_id: Uuid,
    model_version: String,
}

fn encode_embedding(embedding: &StoredEmbedding) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&EmbeddingHeader {
        fact_id: embedding.fact_id,
        model_version: embedding.model_version.clone(),
    })?;
    let mut bytes = (header.len() as u32).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&serialize_vector(&embedding.vector));
    Ok(bytes)
}

fn decode_embedding(bytes: &[u8]) -> Result<StoredEmbedding> {
    let len_bytes: [u8; 4] = bytes.get(0..4).ok_or_else(|| anyhow!("truncated embedding record"))?.try_into()?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_end = 4 + header_len;
    let header: EmbeddingHeader = serde_json::from_slice(
        bytes.get(4..header_end).ok_or_else(|| anyhow!("truncated embedding header"))?,
    )?;
    let vector = deserialize_vector(&bytes[header_end..]);
    Ok(StoredEmbedding { fact_id: header.fact_id, model_version: header.model_version, vector })
}

pub struct FactStore {
    db: Database,
    /// In-memory mirror of all facts, rebuilt from redb at `open`. Modest
    /// fact counts for a single local user make a full cache cheaper than a
    /// redb read on every retrieval call.
    cache: HashMap<Uuid, Fact>,
}

impl FactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening redb store at {}", path.display()))?;

        {
            let tx = db.begin_write()?;
            tx.open_table(FACTS_TABLE)?;
            tx.open_table(EMBEDDINGS_TABLE)?;
            tx.open_table(EXTRACTION_QUEUE_TABLE)?;
            tx.open_table(EMBEDDING_QUEUE_TABLE)?;
            tx.open_table(REMINDERS_TABLE)?;
            tx.commit()?;
        }

        let mut store = Self { db, cache: HashMap::new() };
        store.load_cache()?;
        store.recover_orphan_queues()?;
        Ok(store)
    }

    fn load_cache(&mut self) -> Result<()> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(FACTS_TABLE)?;
        for row in tbl.iter()? {
            let (_, value) = row?;
            let fact: Fact = serde_json::from_slice(value.value())?;
            self.cache.insert(fact.id, fact);
        }
        Ok(())
    }

    /// Startup crash recovery: reset orphan `Processing` rows in both queues
    /// back to `Pending`.
    fn recover_orphan_queues(&mut self) -> Result<()> {
        for table in [EXTRACTION_QUEUE_TABLE, EMBEDDING_QUEUE_TABLE] {
            let tx = self.db.begin_write()?;
            {
                let mut tbl = tx.open_table(table)?;
                let keys: Vec<String> = tbl
                    .iter()?
                    .map(|row| row.map(|(k, _)| k.value().to_string()))
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    if let Some(value) = tbl.get(key.as_str())? {
                        let mut row: QueueRow = serde_json::from_slice(value.value())?;
                        row.recover_orphan();
                        drop(value);
                        let bytes = serde_json::to_vec(&row)?;
                        tbl.insert(key.as_str(), bytes.as_slice())?;
                    }
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    fn persist_fact(&self, fact: &Fact) -> Result<()> {
        let bytes = serde_json::to_vec(fact)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(FACTS_TABLE)?;
            tbl.insert(fact.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a newly extracted or user-provided fact, enforcing "exactly one
    /// active fact per (domain, semantic equivalence class)" by archiving any
    /// existing active fact in the same domain whose text matches
    /// `same_class` and recording the supersede pointer.
    pub fn insert(&mut self, mut fact: Fact, same_class: impl Fn(&Fact) -> bool) -> Result<Uuid> {
        let superseded_id = self
            .cache
            .values()
            .find(|existing| existing.domain == fact.domain && existing.is_active() && same_class(existing))
            .map(|existing| existing.id);

        if let Some(old_id) = superseded_id {
            fact.supersedes = Some(old_id);
            if let Some(old) = self.cache.get_mut(&old_id) {
                old.archived = true;
                let old_clone = old.clone();
                self.persist_fact(&old_clone)?;
            }
        }

        let id = fact.id;
        self.persist_fact(&fact)?;
        self.cache.insert(id, fact);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Fact> {
        self.cache.get(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Fact> {
        self.cache.values()
    }

    pub fn active_by_domain(&self, domain: Domain) -> Vec<&Fact> {
        self.cache
            .values()
            .filter(|f| f.domain == domain && f.is_active())
            .collect()
    }

    /// Re-mention: bump `last_confirmed_at` and clear `stale`.
    pub fn confirm(&mut self, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let Some(fact) = self.cache.get_mut(&id) else {
            return Ok(false);
        };
        fact.confirm(now);
        let snapshot = fact.clone();
        self.persist_fact(&snapshot)?;
        Ok(true)
    }

    /// Decay service: paginated scan of active, non-stale facts, writing only
    /// the `stale` column for facts whose age has reached
    /// [`STALE_AGE_DAYS`]. Aging/low_priority are never written — those are
    /// computed at query time via [`crate::decay::get_decay_status`].
    ///
    /// Returns the number of facts newly marked stale. Yields between
    /// batches via the caller awaiting `tokio::task::yield_now()` — this
    /// function itself is synchronous per batch so the caller controls the
    /// yield point.
    pub fn run_decay_batch(&mut self, offset: usize) -> Result<(usize, bool)> {
        let now = Utc::now();
        let candidates: Vec<Uuid> = self
            .cache
            .values()
            .filter(|f| f.is_active())
            .map(|f| f.id)
            .skip(offset)
            .take(DECAY_SCAN_BATCH_SIZE)
            .collect();

        let has_more = candidates.len() == DECAY_SCAN_BATCH_SIZE;
        let mut newly_stale = 0;
        for id in candidates {
            if let Some(fact) = self.cache.get(&id) {
                let status = get_decay_status(fact.last_confirmed_at, now);
                if status.stage == crate::decay::DecayStage::Stale
                    && fact.age_days(now) >= STALE_AGE_DAYS
                {
                    if let Some(fact) = self.cache.get_mut(&id) {
                        fact.stale = true;
                        let snapshot = fact.clone();
                        self.persist_fact(&snapshot)?;
                        newly_stale += 1;
                    }
                }
            }
        }
        Ok((newly_stale, has_more))
    }

    // ── embeddings ───────────────────────────────────────────────────────

    pub fn put_embedding(&self, embedding: &StoredEmbedding) -> Result<()> {
        let key = format!("{}:{}", embedding.fact_id, embedding.model_version);
        let bytes = encode_embedding(embedding)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(EMBEDDINGS_TABLE)?;
            tbl.insert(key.as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_embedding(&self, fact_id: Uuid, model_version: &str) -> Result<Option<StoredEmbedding>> {
        let key = format!("{fact_id}:{model_version}");
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(EMBEDDINGS_TABLE)?;
        match tbl.get(key.as_str())? {
            None => Ok(None),
            Some(value) => Ok(Some(decode_embedding(value.value())?)),
        }
    }

    pub fn all_embeddings(&self, model_version: &str) -> Result<Vec<StoredEmbedding>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(EMBEDDINGS_TABLE)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, value) = row?;
            let embedding = decode_embedding(value.value())?;
            if embedding.model_version == model_version {
                out.push(embedding);
            }
        }
        Ok(out)
    }

    // ── reminders ────────────────────────────────────────────────────────

    /// Persist a reminder under its id, overwriting any prior snapshot. Called
    /// on every status transition so a crash mid-delivery leaves the last
    /// committed status (not an older one) for `all_reminders` to recover.
    pub fn put_reminder(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(REMINDERS_TABLE)?;
            tbl.insert(id, bytes)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_reminder(&self, id: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(REMINDERS_TABLE)?;
            tbl.remove(id)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_reminders(&self) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(REMINDERS_TABLE)?;
            let keys: Vec<String> = tbl.iter()?.map(|row| row.map(|(k, _)| k.value().to_string())).collect::<Result<_, _>>()?;
            for key in keys {
                tbl.remove(key.as_str())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Raw reminder bytes, keyed by id — the caller (runtime crate) owns the
    /// `Reminder` type and its own (de)serialization.
    pub fn all_reminders(&self) -> Result<Vec<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(REMINDERS_TABLE)?;
        let mut out = Vec::new();
        for row in tbl.iter()? {
            let (_, value) = row?;
            out.push(value.value().to_vec());
        }
        Ok(out)
    }

    /// Facts missing an embedding under `model_version` — seeded into the
    /// pending-embedding queue at startup.
    pub fn facts_missing_embedding(&self, model_version: &str) -> Result<Vec<Uuid>> {
        let mut missing = Vec::new();
        for fact in self.cache.values() {
            if self.get_embedding(fact.id, model_version)?.is_none() {
                missing.push(fact.id);
            }
        }
        Ok(missing)
    }

    // ── queues ───────────────────────────────────────────────────────────

    pub fn enqueue(&self, table: QueueTable, row: &QueueRow) -> Result<()> {
        let bytes = serde_json::to_vec(row)?;
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(table.definition())?;
            tbl.insert(row.id.to_string().as_str(), bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_row(&self, table: QueueTable, row: &QueueRow) -> Result<()> {
        self.enqueue(table, row)
    }

    /// Pull up to `limit` rows with status `Pending` that are ready for
    /// retry, oldest-inserted first.
    pub fn pending_rows(&self, table: QueueTable, limit: usize, now: chrono::DateTime<Utc>) -> Result<Vec<QueueRow>> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(table.definition())?;
        let mut rows = Vec::new();
        for entry in tbl.iter()? {
            let (_, value) = entry?;
            let row: QueueRow = serde_json::from_slice(value.value())?;
            if row.status == QueueStatus::Pending && row.ready_for_retry(now) {
                rows.push(row);
            }
        }
        rows.truncate(limit);
        Ok(rows)
    }

    /// Hard cap enforcement: drop the oldest rows (by lowest attempts, then
    /// insertion order proxy via id) when the queue exceeds `cap`.
    pub fn enforce_queue_cap(&self, table: QueueTable, cap: usize) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(table.definition())?;
        let mut ids: Vec<String> = Vec::new();
        for entry in tbl.iter()? {
            let (key, _) = entry?;
            ids.push(key.value().to_string());
        }
        drop(tbl);
        drop(tx);

        if ids.len() <= cap {
            return Ok(0);
        }
        let overflow = ids.len() - cap;
        let to_drop = &ids[..overflow];
        let tx = self.db.begin_write()?;
        {
            let mut tbl = tx.open_table(table.definition())?;
            for id in to_drop {
                tbl.remove(id.as_str())?;
            }
        }
        tx.commit()?;
        Ok(overflow)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum QueueTable {
    Extraction,
    Embedding,
}

impl QueueTable {
    fn definition(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            QueueTable::Extraction => EXTRACTION_QUEUE_TABLE,
            QueueTable::Embedding => EMBEDDING_QUEUE_TABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Confidence, Source};

    fn temp_store() -> (tempfile::TempDir, FactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path().join("facts.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_and_get_round_trips() {
        let (_dir, mut store) = temp_store();
        let fact = Fact::new(Domain::Preferences, "likes tea", Confidence::High, "default", Source::Explicit, Utc::now());
        let id = store.insert(fact, |_| false).unwrap();
        assert!(store.get(id).is_some());
    }

    #[test]
    fn insert_supersedes_same_class_active_fact() {
        let (_dir, mut store) = temp_store();
        let now = Utc::now();
        let first = Fact::new(Domain::Work, "works at Acme", Confidence::High, "default", Source::Explicit, now);
        let first_id = store.insert(first, |_| false).unwrap();

        let second = Fact::new(Domain::Work, "works at Globex", Confidence::High, "default", Source::Explicit, now);
        let second_id = store.insert(second, |f| f.id == first_id).unwrap();

        assert!(store.get(first_id).unwrap().archived);
        assert_eq!(store.get(second_id).unwrap().supersedes, Some(first_id));
    }

    #[test]
    fn confirm_clears_stale() {
        let (_dir, mut store) = temp_store();
        let fact = Fact::new(Domain::Health, "allergic to peanuts", Confidence::High, "default", Source::Explicit, Utc::now());
        let id = store.insert(fact, |_| false).unwrap();
        store.cache.get_mut(&id).unwrap().stale = true;
        store.confirm(id).unwrap();
        assert!(!store.get(id).unwrap().stale);
    }

    #[test]
    fn decay_batch_marks_only_stale_facts() {
        let (_dir, mut store) = temp_store();
        let old = Utc::now() - chrono::Duration::days(200);
        let mut fact = Fact::new(Domain::General, "old fact", Confidence::Medium, "default", Source::Inferred, old);
        fact.last_confirmed_at = old;
        let id = store.insert(fact, |_| false).unwrap();

        let (newly_stale, has_more) = store.run_decay_batch(0).unwrap();
        assert_eq!(newly_stale, 1);
        assert!(!has_more);
        assert!(store.get(id).unwrap().stale);
    }

    #[test]
    fn embedding_round_trips() {
        let (_dir, store) = temp_store();
        let fact_id = Uuid::new_v4();
        let embedding = StoredEmbedding {
            fact_id,
            model_version: "v1".to_string(),
            vector: vec![0.1, 0.2, 0.3],
        };
        store.put_embedding(&embedding).unwrap();
        let fetched = store.get_embedding(fact_id, "v1").unwrap().unwrap();
        assert_eq!(fetched.vector, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn reminder_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.redb");
        {
            let store = FactStore::open(&path).unwrap();
            store.put_reminder("r1", b"triggered-payload").unwrap();
        }
        let store = FactStore::open(&path).unwrap();
        let all = store.all_reminders().unwrap();
        assert_eq!(all, vec![b"triggered-payload".to_vec()]);
    }

    #[test]
    fn clear_reminders_empties_the_table() {
        let (_dir, store) = temp_store();
        store.put_reminder("r1", b"x").unwrap();
        store.put_reminder("r2", b"y").unwrap();
        store.clear_reminders().unwrap();
        assert!(store.all_reminders().unwrap().is_empty());
    }

    #[test]
    fn queue_cap_drops_oldest_on_overflow() {
        let (_dir, store) = temp_store();
        for _ in 0..5 {
            store.enqueue(QueueTable::Extraction, &QueueRow::new(Uuid::new_v4())).unwrap();
        }
        let dropped = store.enforce_queue_cap(QueueTable::Extraction, 3).unwrap();
        assert_eq!(dropped, 2);
    }

    #[test]
    fn orphan_processing_rows_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.redb");
        {
            let store = FactStore::open(&path).unwrap();
            let mut row = QueueRow::new(Uuid::new_v4());
            row.mark_processing(Utc::now());
            store.enqueue(QueueTable::Extraction, &row).unwrap();
        }
        let store = FactStore::open(&path).unwrap();
        let pending = store.pending_rows(QueueTable::Extraction, 10, Utc::now()).unwrap();
        assert_eq!(pending.len(), 1);
    }
}
