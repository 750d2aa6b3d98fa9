/**
 * BACKLOG CONSOLIDATOR - Fusion des snapshots en attente contre la baseline
 *
 * RÔLE :
 * Draine les entrées pending par (device, catégorie) en ordre de séquence
 * strict, replie les entrées empilées vers le snapshot le plus récent,
 * calcule un ChangeSet par diff à clés stables, puis remplace la baseline
 * atomiquement. Un cycle = une unité de charge, quel que soit le nombre
 * d'entrées repliées.
 *
 * GARANTIES :
 * - Single-writer par (device, catégorie) : toute mutation passe sous le
 *   verrou du store
 * - Une entrée de séquence <= baseline n'est jamais appliquée
 * - Un échec de diff marque l'entrée failed et laisse la baseline intacte
 * - Re-consolider une entrée déjà consolidée est un no-op
 */

use crate::errors::CoreError;
use crate::state::{new_state, Shared};
use crate::telemetry::{Category, EntryState, Keyed, Snapshot, TelemetryEntry};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

type CatKey = (String, Category);

/// Dernière vue consolidée d'un device pour une catégorie.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub device: String,
    pub category: Category,
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeItem {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModifiedItem {
    pub key: String,
    pub before: Value,
    pub after: Value,
}

/// Diff disjoint added/removed/modified entre un snapshot et la baseline.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    pub tenant: String,
    pub device: String,
    pub category: Category,
    pub baseline_seq: Option<u64>,
    pub new_seq: u64,
    pub added: Vec<ChangeItem>,
    pub removed: Vec<ChangeItem>,
    pub modified: Vec<ModifiedItem>,
}

impl ChangeSet {
    pub fn total_changes(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }
}

fn to_value<T: Serialize>(item: &T) -> Result<Value, CoreError> {
    serde_json::to_value(item).map_err(|e| CoreError::Consolidation(e.to_string()))
}

fn index_by_key<'a, T: Keyed>(items: &'a [T]) -> Result<BTreeMap<String, &'a T>, CoreError> {
    let mut map = BTreeMap::new();
    for item in items {
        if map.insert(item.key(), item).is_some() {
            return Err(CoreError::Consolidation(format!(
                "duplicate key '{}' in snapshot",
                item.key()
            )));
        }
    }
    Ok(map)
}

fn diff_keyed<T: Keyed + PartialEq + Serialize>(
    old: &[T],
    new: &[T],
) -> Result<(Vec<ChangeItem>, Vec<ChangeItem>, Vec<ModifiedItem>), CoreError> {
    let old_idx = index_by_key(old)?;
    let new_idx = index_by_key(new)?;

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();

    for (key, item) in &new_idx {
        match old_idx.get(key) {
            None => added.push(ChangeItem { key: key.clone(), value: to_value(item)? }),
            Some(before) if *before != *item => modified.push(ModifiedItem {
                key: key.clone(),
                before: to_value(before)?,
                after: to_value(item)?,
            }),
            Some(_) => {}
        }
    }
    for (key, item) in &old_idx {
        if !new_idx.contains_key(key) {
            removed.push(ChangeItem { key: key.clone(), value: to_value(item)? });
        }
    }
    Ok((added, removed, modified))
}

/// Diff de deux snapshots de la même catégorie, par égalité de clé.
pub fn diff_snapshots(
    old: &Snapshot,
    new: &Snapshot,
) -> Result<(Vec<ChangeItem>, Vec<ChangeItem>, Vec<ModifiedItem>), CoreError> {
    match (old, new) {
        (Snapshot::Hardware(a), Snapshot::Hardware(b)) => diff_keyed(a, b),
        (Snapshot::Storage(a), Snapshot::Storage(b)) => diff_keyed(a, b),
        (Snapshot::Network(a), Snapshot::Network(b)) => diff_keyed(a, b),
        (Snapshot::Events(a), Snapshot::Events(b)) => diff_keyed(a, b),
        (Snapshot::Software(a), Snapshot::Software(b)) => diff_keyed(a, b),
        _ => Err(CoreError::Consolidation(format!(
            "category mismatch: baseline {:?} vs snapshot {:?}",
            old.category(),
            new.category()
        ))),
    }
}

fn empty_snapshot(category: Category) -> Snapshot {
    match category {
        Category::Hardware => Snapshot::Hardware(Vec::new()),
        Category::Storage => Snapshot::Storage(Vec::new()),
        Category::Network => Snapshot::Network(Vec::new()),
        Category::Events => Snapshot::Events(Vec::new()),
        Category::Software => Snapshot::Software(Vec::new()),
    }
}

struct Inner {
    entries: HashMap<String, TelemetryEntry>,
    queues: HashMap<CatKey, BTreeMap<u64, String>>,
    baselines: HashMap<CatKey, Baseline>,
}

pub struct Consolidator {
    inner: Shared<Inner>,
    /// Compteur de charge : une unité par cycle d'analyse, pas par entrée.
    charges: AtomicU64,
    retention: Duration,
}

impl Consolidator {
    pub fn new(consolidated_retention_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: new_state(Inner {
                entries: HashMap::new(),
                queues: HashMap::new(),
                baselines: HashMap::new(),
            }),
            charges: AtomicU64::new(0),
            retention: Duration::seconds(consolidated_retention_secs as i64),
        })
    }

    /// Met une entrée pending en file. Les doublons at-least-once (même
    /// séquence, même file) sont absorbés ici.
    pub fn enqueue(&self, entry: TelemetryEntry) {
        let mut inner = self.inner.lock();
        let key = (entry.device.clone(), entry.category());
        let queue = inner.queues.entry(key).or_default();
        if queue.contains_key(&entry.seq) {
            debug!("duplicate telemetry seq {} for {}, dropped", entry.seq, entry.device);
            return;
        }
        queue.insert(entry.seq, entry.id.clone());
        inner.entries.insert(entry.id.clone(), entry);
    }

    /// Un cycle de consolidation pour (device, catégorie). Replie toutes les
    /// entrées pending vers la plus récente, diffe contre la baseline et la
    /// remplace atomiquement. `Ok(None)` si rien à faire (aucune charge).
    pub fn consolidate(&self, device: &str, category: Category) -> Result<Option<ChangeSet>, CoreError> {
        let mut inner = self.inner.lock();
        let key = (device.to_string(), category);

        let Some(queue) = inner.queues.remove(&key) else {
            return Ok(None);
        };
        let baseline_seq = inner.baselines.get(&key).map(|b| b.seq);

        let mut folded: Vec<String> = Vec::new();
        for (seq, id) in queue {
            if baseline_seq.is_some_and(|b| seq <= b) {
                // Jamais appliquée : dépassée par la baseline courante.
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.state = EntryState::Processed;
                    entry.finished_at = Some(OffsetDateTime::now_utc());
                }
            } else {
                folded.push(id);
            }
        }
        let Some(newest_id) = folded.last().cloned() else {
            return Ok(None);
        };

        // À partir d'ici un diff va tourner : le cycle est facturé.
        self.charges.fetch_add(1, Ordering::Relaxed);

        let newest = inner.entries.get(&newest_id).cloned().ok_or_else(|| {
            CoreError::Consolidation(format!("missing entry {newest_id} in backlog"))
        })?;
        let old_snapshot = inner
            .baselines
            .get(&key)
            .map(|b| b.snapshot.clone())
            .unwrap_or_else(|| empty_snapshot(category));

        match diff_snapshots(&old_snapshot, &newest.snapshot) {
            Ok((added, removed, modified)) => {
                let now = OffsetDateTime::now_utc();
                inner.baselines.insert(
                    key,
                    Baseline {
                        device: device.to_string(),
                        category,
                        seq: newest.seq,
                        captured_at: now,
                        snapshot: newest.snapshot.clone(),
                    },
                );
                for id in &folded {
                    if let Some(entry) = inner.entries.get_mut(id) {
                        entry.state = EntryState::Consolidated;
                        entry.finished_at = Some(now);
                    }
                }
                Ok(Some(ChangeSet {
                    tenant: newest.tenant,
                    device: device.to_string(),
                    category,
                    baseline_seq,
                    new_seq: newest.seq,
                    added,
                    removed,
                    modified,
                }))
            }
            Err(e) => {
                // Baseline intacte : les entrées suivantes consolideront
                // contre le dernier bon état.
                let now = OffsetDateTime::now_utc();
                for id in &folded {
                    if let Some(entry) = inner.entries.get_mut(id) {
                        entry.state = EntryState::Failed;
                        entry.failure_reason = Some(e.to_string());
                        entry.finished_at = Some(now);
                    }
                }
                warn!("consolidation failed for {device}/{}: {e}", category.as_str());
                Err(e)
            }
        }
    }

    /// Draine toutes les files non vides. L'échec d'un device ne bloque
    /// jamais les autres.
    pub fn drain_all(&self) -> Vec<ChangeSet> {
        let keys: Vec<CatKey> = {
            let inner = self.inner.lock();
            inner.queues.keys().cloned().collect()
        };
        let mut change_sets = Vec::new();
        for (device, category) in keys {
            match self.consolidate(&device, category) {
                Ok(Some(cs)) => change_sets.push(cs),
                Ok(None) => {}
                Err(e) => warn!("skipping {device}/{}: {e}", category.as_str()),
            }
        }
        change_sets
    }

    pub fn baseline(&self, device: &str, category: Category) -> Option<Baseline> {
        self.inner.lock().baselines.get(&(device.to_string(), category)).cloned()
    }

    pub fn pending_count(&self, device: &str, category: Category) -> usize {
        self.inner
            .lock()
            .queues
            .get(&(device.to_string(), category))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn entry(&self, id: &str) -> Option<TelemetryEntry> {
        self.inner.lock().entries.get(id).cloned()
    }

    /// Entrées en erreur terminale, avec leur raison, pour inspection.
    pub fn failed_entries(&self) -> Vec<TelemetryEntry> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.state == EntryState::Failed)
            .cloned()
            .collect()
    }

    pub fn charges(&self) -> u64 {
        self.charges.load(Ordering::Relaxed)
    }

    /// Purge les entrées consolidées/dépassées au-delà de la rétention.
    pub fn purge_consolidated(&self) -> usize {
        self.purge_consolidated_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn purge_consolidated_at(&self, now: OffsetDateTime) -> usize {
        let mut inner = self.inner.lock();
        let retention = self.retention;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            if matches!(e.state, EntryState::Consolidated | EntryState::Processed) {
                e.finished_at.map(|t| now - t <= retention).unwrap_or(true)
            } else {
                true
            }
        });
        before - inner.entries.len()
    }

    /// Task périodique : draine le backlog, pousse chaque ChangeSet vers
    /// l'agrégation santé, puis purge les entrées hors rétention.
    pub fn spawn_drain(
        self: &Arc<Self>,
        board: Arc<crate::health::HealthBoard>,
        every: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let consolidator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                for change_set in consolidator.drain_all() {
                    let score = board.record_change_set(&change_set);
                    debug!(
                        "consolidated {}/{}: {} changes, score {score}",
                        change_set.device,
                        change_set.category.as_str(),
                        change_set.total_changes()
                    );
                }
                let purged = consolidator.purge_consolidated();
                if purged > 0 {
                    debug!("purged {purged} entries past retention");
                }
            }
        })
    }

    /// Nettoyage opérateur : retire les entrées failed.
    pub fn purge_failed(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.state != EntryState::Failed);
        before - inner.entries.len()
    }
}
