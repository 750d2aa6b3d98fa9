/**
 * HEALTH AGGREGATOR - Scores hiérarchiques et auto-santé du kernel
 *
 * DEUX SURFACES :
 * 1. HealthBoard : transforme chaque ChangeSet en score device [1,100]
 *    via une règle de scoring enfichable, puis recalcule les niveaux
 *    supérieurs (Group, Organization, Tenant) par moyenne arithmétique
 *    du jeu complet d'enfants. Recalcul toujours depuis la table vive,
 *    jamais depuis un enfant périmé.
 * 2. HealthTracker : uptime, état transport et compteurs du kernel,
 *    publiés périodiquement sur admin.health.kernel.
 *
 * La moyenne est commutative : recalculer après une mise à jour
 * partielle donne le même résultat qu'un recalcul complet, quel que
 * soit l'ordre d'arrivée des devices d'un même groupe.
 */

use crate::bus::TenantBus;
use crate::consolidate::ChangeSet;
use crate::state::{new_map, Shared};
use crate::telemetry::Category;
use crate::tenants::TenantDirectory;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, info, warn};

/// Borne un score dans [1,100]. Un device catastrophique vaut 1, pas 0.
fn clamp_score(score: i32) -> i32 {
    score.clamp(1, 100)
}

/// Poids de pénalité par type de changement, propres à une catégorie.
#[derive(Debug, Clone, Copy)]
pub struct SeverityWeights {
    pub added: i32,
    pub removed: i32,
    pub modified: i32,
}

/// Règle de scoring enfichable : ChangeSet -> score device.
/// Toute implémentation doit rester dans [1,100].
pub trait ScoreRule: Send + Sync {
    fn score(&self, change: &ChangeSet) -> i32;
}

/// Règle par défaut : 100 moins les pénalités pondérées par catégorie.
/// Un disque qui disparaît pèse plus lourd qu'un paquet mis à jour.
pub struct DefaultScoreRule {
    weights: HashMap<Category, SeverityWeights>,
}

impl Default for DefaultScoreRule {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert(Category::Hardware, SeverityWeights { added: 8, removed: 12, modified: 6 });
        weights.insert(Category::Storage, SeverityWeights { added: 6, removed: 10, modified: 4 });
        weights.insert(Category::Network, SeverityWeights { added: 5, removed: 8, modified: 4 });
        weights.insert(Category::Events, SeverityWeights { added: 3, removed: 0, modified: 2 });
        weights.insert(Category::Software, SeverityWeights { added: 2, removed: 4, modified: 1 });
        Self { weights }
    }
}

impl ScoreRule for DefaultScoreRule {
    fn score(&self, change: &ChangeSet) -> i32 {
        let w = self
            .weights
            .get(&change.category)
            .copied()
            .unwrap_or(SeverityWeights { added: 5, removed: 5, modified: 5 });
        let penalty = change.added.len() as i32 * w.added
            + change.removed.len() as i32 * w.removed
            + change.modified.len() as i32 * w.modified;
        clamp_score(100 - penalty)
    }
}

/// Entité porteuse d'un score, du device jusqu'au tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "level", rename_all = "lowercase")]
pub enum EntityRef {
    Device { id: String },
    Group { tenant: String, group: String },
    Organization { tenant: String, org: String },
    Tenant { id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreView {
    pub entity: EntityRef,
    pub category: Category,
    pub score: i32,
}

/// Table vive des scores + recalcul hiérarchique.
pub struct HealthBoard {
    scores: Shared<HashMap<(EntityRef, Category), i32>>,
    rule: Box<dyn ScoreRule>,
    directory: TenantDirectory,
}

impl HealthBoard {
    pub fn new(directory: TenantDirectory, rule: Box<dyn ScoreRule>) -> Arc<Self> {
        Arc::new(Self { scores: new_map(), rule, directory })
    }

    /// Applique un ChangeSet : score device, puis propagation
    /// Group -> Organization -> Tenant. Chaque niveau est recalculé
    /// depuis le jeu complet de ses enfants dans la table vive.
    pub fn record_change_set(&self, change: &ChangeSet) -> i32 {
        let device_score = clamp_score(self.rule.score(change));
        let category = change.category;

        let mut scores = self.scores.lock();
        scores.insert(
            (EntityRef::Device { id: change.device.clone() }, category),
            device_score,
        );
        debug!(
            "device {} scored {} for {}",
            change.device,
            device_score,
            category.as_str()
        );

        let Some(membership) = self.directory.membership(&change.device) else {
            // Device hors annuaire : score local seulement.
            return device_score;
        };
        let tenant = membership.tenant.clone();

        let group_ref = EntityRef::Group { tenant: tenant.clone(), group: membership.group.clone() };
        let devices = self.directory.group_devices(&tenant, &membership.group);
        let children: Vec<EntityRef> =
            devices.into_iter().map(|id| EntityRef::Device { id }).collect();
        Self::recompute(&mut scores, group_ref, category, &children);

        let org_ref = EntityRef::Organization { tenant: tenant.clone(), org: membership.org.clone() };
        let groups = self.directory.org_groups(&tenant, &membership.org);
        let children: Vec<EntityRef> = groups
            .into_iter()
            .map(|group| EntityRef::Group { tenant: tenant.clone(), group })
            .collect();
        Self::recompute(&mut scores, org_ref, category, &children);

        let tenant_ref = EntityRef::Tenant { id: tenant.clone() };
        let orgs = self.directory.tenant_orgs(&tenant);
        let children: Vec<EntityRef> = orgs
            .into_iter()
            .map(|org| EntityRef::Organization { tenant: tenant.clone(), org })
            .collect();
        Self::recompute(&mut scores, tenant_ref, category, &children);

        device_score
    }

    /// Moyenne arithmétique des enfants présents, arrondie au demi
    /// supérieur. Les enfants sans score pour cette catégorie sont
    /// ignorés, pas comptés comme zéro.
    fn recompute(
        scores: &mut HashMap<(EntityRef, Category), i32>,
        entity: EntityRef,
        category: Category,
        children: &[EntityRef],
    ) {
        let present: Vec<i32> = children
            .iter()
            .filter_map(|child| scores.get(&(child.clone(), category)).copied())
            .collect();
        if present.is_empty() {
            return;
        }
        let sum: i64 = present.iter().map(|s| *s as i64).sum();
        let mean = (sum as f64 / present.len() as f64).round() as i32;
        scores.insert((entity, category), clamp_score(mean));
    }

    pub fn score(&self, entity: &EntityRef, category: Category) -> Option<i32> {
        self.scores.lock().get(&(entity.clone(), category)).copied()
    }

    /// Scores par catégorie d'un device.
    pub fn device_scores(&self, device: &str) -> HashMap<Category, i32> {
        let scores = self.scores.lock();
        Category::ALL
            .iter()
            .filter_map(|c| {
                scores
                    .get(&(EntityRef::Device { id: device.to_string() }, *c))
                    .map(|s| (*c, *s))
            })
            .collect()
    }

    /// Vue complète d'un tenant : toutes les entités de sa hiérarchie.
    pub fn tenant_view(&self, tenant: &str) -> Vec<ScoreView> {
        let scores = self.scores.lock();
        let mut views: Vec<ScoreView> = scores
            .iter()
            .filter(|((entity, _), _)| match entity {
                EntityRef::Tenant { id } => id == tenant,
                EntityRef::Organization { tenant: t, .. }
                | EntityRef::Group { tenant: t, .. } => t == tenant,
                EntityRef::Device { id } => self
                    .directory
                    .membership(id)
                    .map(|m| m.tenant == tenant)
                    .unwrap_or(false),
            })
            .map(|((entity, category), score)| ScoreView {
                entity: entity.clone(),
                category: *category,
                score: *score,
            })
            .collect();
        views.sort_by(|a, b| format!("{:?}", a.entity).cmp(&format!("{:?}", b.entity)));
        views
    }

    pub fn tracked_count(&self) -> usize {
        self.scores.lock().len()
    }
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub scores_tracked: u32,
    pub memory_usage_mb: f32,
    pub transport_status: String,
    pub transport_reconnects: u32,
}

/// État interne du kernel, partagé avec la boucle transport.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    transport_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            transport_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_transport_connected(&self) {
        *self.transport_status.lock() = "connected".to_string();
    }

    pub fn mark_transport_down(&self) {
        *self.transport_status.lock() = "down".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        *self.transport_status.lock() = "reconnecting".to_string();
    }

    pub fn transport_status(&self) -> String {
        self.transport_status.lock().clone()
    }

    pub fn snapshot(&self, devices_tracked: u32, scores_tracked: u32) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked,
            scores_tracked,
            memory_usage_mb: get_memory_usage_mb(),
            transport_status: self.transport_status.lock().clone(),
            transport_reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto de la santé kernel sur le bus.
    pub fn spawn_health_publisher(
        &self,
        bus: Arc<TenantBus>,
        service_token: String,
        board: Arc<HealthBoard>,
        registry: crate::sessions::DeviceRegistry,
        every: Duration,
    ) -> task::JoinHandle<()> {
        let tracker = self.clone();
        let subject = crate::subjects::Subject::AdminHealth { component: "kernel".to_string() };
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = tracker.snapshot(
                    registry.count().await as u32,
                    board.tracked_count() as u32,
                );
                match serde_json::to_vec(&health) {
                    Ok(payload) => {
                        if let Err(e) = bus.publish(&service_token, &subject, &payload) {
                            warn!("failed to publish kernel health: {e}");
                        } else {
                            info!(
                                "published kernel health (uptime: {}s, devices: {})",
                                health.uptime_seconds, health.devices_tracked
                            );
                        }
                    }
                    Err(e) => warn!("failed to encode kernel health: {e}"),
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    let pid = std::process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|s| s.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0;
                    }
                }
            }
        }
    }

    let _ = pid;
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::{ChangeItem, ChangeSet, ModifiedItem};
    use crate::tenants::CredentialStore;
    use serde_json::json;

    fn change(device: &str, category: Category, added: usize, removed: usize, modified: usize) -> ChangeSet {
        ChangeSet {
            tenant: "acme".into(),
            device: device.into(),
            category,
            baseline_seq: Some(1),
            new_seq: 2,
            added: (0..added)
                .map(|i| ChangeItem { key: format!("a{i}"), value: json!({}) })
                .collect(),
            removed: (0..removed)
                .map(|i| ChangeItem { key: format!("r{i}"), value: json!({}) })
                .collect(),
            modified: (0..modified)
                .map(|i| ModifiedItem { key: format!("m{i}"), before: json!(1), after: json!(2) })
                .collect(),
        }
    }

    fn directory_with(devices: &[(&str, &str, &str)]) -> TenantDirectory {
        let directory = TenantDirectory::new(CredentialStore::new());
        directory.provision_tenant("acme").unwrap();
        for (device, org, group) in devices {
            directory
                .assign_device(
                    device,
                    crate::tenants::Membership {
                        tenant: "acme".into(),
                        org: (*org).into(),
                        group: (*group).into(),
                    },
                )
                .unwrap();
        }
        directory
    }

    fn board(devices: &[(&str, &str, &str)]) -> Arc<HealthBoard> {
        HealthBoard::new(directory_with(devices), Box::new(DefaultScoreRule::default()))
    }

    #[test]
    fn test_score_always_clamped() {
        let board = board(&[("dev-1", "ops", "paris")]);
        // Assez de disques perdus pour passer sous zéro sans clamp.
        let score = board.record_change_set(&change("dev-1", Category::Storage, 0, 50, 0));
        assert_eq!(score, 1);
        // Aucun changement : score parfait.
        let score = board.record_change_set(&change("dev-1", Category::Storage, 0, 0, 0));
        assert_eq!(score, 100);
    }

    #[test]
    fn test_default_rule_weighted_penalties() {
        let rule = DefaultScoreRule::default();
        // Storage : 1 removed (10) + 2 modified (2x4) = 18 de pénalité.
        let score = rule.score(&change("dev-1", Category::Storage, 0, 1, 2));
        assert_eq!(score, 82);
    }

    #[test]
    fn test_group_mean_is_order_independent() {
        let members = [("dev-1", "ops", "paris"), ("dev-2", "ops", "paris")];
        let heavy = change("dev-1", Category::Network, 0, 2, 0); // 100-16=84
        let light = change("dev-2", Category::Network, 0, 0, 1); // 100-4=96

        let board_a = board(&members);
        board_a.record_change_set(&heavy);
        board_a.record_change_set(&light);

        let board_b = board(&members);
        board_b.record_change_set(&light);
        board_b.record_change_set(&heavy);

        let group = EntityRef::Group { tenant: "acme".into(), group: "paris".into() };
        let a = board_a.score(&group, Category::Network).unwrap();
        let b = board_b.score(&group, Category::Network).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 90);
    }

    #[test]
    fn test_rollup_propagates_to_tenant() {
        let board = board(&[
            ("dev-1", "ops", "paris"),
            ("dev-2", "ops", "lyon"),
        ]);
        board.record_change_set(&change("dev-1", Category::Software, 40, 0, 0)); // 100-80=20
        board.record_change_set(&change("dev-2", Category::Software, 0, 0, 0)); // 100

        let org = EntityRef::Organization { tenant: "acme".into(), org: "ops".into() };
        // Deux groupes d'un device chacun : moyenne (20+100)/2 = 60.
        assert_eq!(board.score(&org, Category::Software), Some(60));
        let tenant = EntityRef::Tenant { id: "acme".into() };
        assert_eq!(board.score(&tenant, Category::Software), Some(60));
    }

    #[test]
    fn test_mean_rounds_half_up() {
        let board = board(&[("dev-1", "ops", "paris"), ("dev-2", "ops", "paris")]);
        board.record_change_set(&change("dev-1", Category::Events, 1, 0, 0)); // 97
        board.record_change_set(&change("dev-2", Category::Events, 0, 0, 0)); // 100
        let group = EntityRef::Group { tenant: "acme".into(), group: "paris".into() };
        // (97+100)/2 = 98.5 -> 99
        assert_eq!(board.score(&group, Category::Events), Some(99));
    }

    #[test]
    fn test_partial_group_ignores_unscored_members() {
        let board = board(&[("dev-1", "ops", "paris"), ("dev-2", "ops", "paris")]);
        board.record_change_set(&change("dev-1", Category::Hardware, 0, 1, 0)); // 88
        let group = EntityRef::Group { tenant: "acme".into(), group: "paris".into() };
        // dev-2 n'a pas encore de score : il ne tire pas la moyenne vers le bas.
        assert_eq!(board.score(&group, Category::Hardware), Some(88));
    }

    #[test]
    fn test_unassigned_device_scores_locally_only() {
        let board = board(&[]);
        let score = board.record_change_set(&change("ghost", Category::Storage, 0, 0, 1));
        assert_eq!(score, 96);
        assert_eq!(board.tracked_count(), 1);
    }

    #[test]
    fn test_tenant_view_lists_hierarchy() {
        let board = board(&[("dev-1", "ops", "paris")]);
        board.record_change_set(&change("dev-1", Category::Storage, 0, 0, 0));
        let views = board.tenant_view("acme");
        // Device + group + org + tenant pour une catégorie.
        assert_eq!(views.len(), 4);
        assert!(views.iter().all(|v| v.score == 100));
    }

    #[test]
    fn test_tracker_transport_lifecycle() {
        let tracker = HealthTracker::new();
        assert_eq!(tracker.transport_status(), "connecting");
        tracker.mark_transport_connected();
        assert_eq!(tracker.transport_status(), "connected");
        tracker.increment_reconnects();
        assert_eq!(tracker.transport_status(), "reconnecting");
        tracker.mark_transport_down();
        let health = tracker.snapshot(3, 7);
        assert_eq!(health.transport_status, "down");
        assert_eq!(health.transport_reconnects, 1);
        assert_eq!(health.devices_tracked, 3);
    }
}
