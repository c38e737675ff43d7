// src/config/mod.rs - configuration snapshots, validation, hot reload and backups

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::storage::RewardStore;
use crate::types::{HealthStatus, ParsingRule, RuleChanges, StorageError};

/// Format version stamped into exports and backups.
const EXPORT_FORMAT_VERSION: &str = "1.0";
/// Optional operator override file inside the config directory.
const SETTINGS_FILE: &str = "settings.yaml";
/// Subdirectory of the config directory holding backup archives.
const BACKUPS_DIR: &str = "backups";
/// Minimum spacing between watcher-triggered reloads.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

pub const MIN_CLEANUP_INTERVAL_SECONDS: u64 = 60;
pub const MIN_GRANT_EXPIRY_DELAY_SECONDS: u64 = 30;
/// One year; also the hard ceiling the cleanup pass clamps the delay to.
pub const MAX_GRANT_EXPIRY_DELAY_SECONDS: u64 = 31_536_000;
pub const MAX_BROADCAST_BATCH_SIZE: u32 = 100;
pub const MAX_PARSING_RETRY_LIMIT: u32 = 10;

/// Keys under which scalar settings live in the store's `settings` table.
mod keys {
    pub const ADMIN_REFS: &str = "admin_refs";
    pub const CLEANUP_INTERVAL_SECONDS: &str = "cleanup_interval_seconds";
    pub const GRANT_EXPIRY_DELAY_SECONDS: &str = "grant_expiry_delay_seconds";
    pub const BROADCAST_BATCH_SIZE: &str = "broadcast_batch_size";
    pub const MAX_PARSING_RETRIES: &str = "max_parsing_retries";
    pub const RETENTION_DAYS: &str = "retention_days";
    pub const MONITORING_INTERVAL_SECONDS: &str = "monitoring_interval_seconds";
}

/// Broadcast to subscribers whenever the configuration changes shape.
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    Reloaded { rule_count: usize },
    ReloadRejected { errors: Vec<String> },
    RuleAdded { id: i64, source_name: String },
    RuleUpdated { id: i64 },
    BackupCreated { id: String },
    BackupRestored { id: String },
}

/// Scalar settings carried by every snapshot. Values come from the store,
/// then the `settings.yaml` override file, then these built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSettings {
    /// Accounts allowed to run administrative operations. Never empty.
    pub admin_refs: Vec<i64>,
    pub cleanup_interval_seconds: u64,
    /// Grace period before an expired grant is actually swept.
    pub grant_expiry_delay_seconds: u64,
    pub broadcast_batch_size: u32,
    /// Upper bound on persistence attempts per parsed reward.
    pub max_parsing_retries: u32,
    /// Transactions older than this many days are pruned by cleanup.
    pub retention_days: u32,
    pub monitoring_interval_seconds: u64,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            admin_refs: vec![1],
            cleanup_interval_seconds: 300,
            grant_expiry_delay_seconds: 60,
            broadcast_batch_size: 25,
            max_parsing_retries: 3,
            retention_days: 90,
            monitoring_interval_seconds: 60,
        }
    }
}

/// Shape of the optional `settings.yaml` override file. Absent fields fall
/// through to the built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsOverrides {
    pub admin_refs: Option<Vec<i64>>,
    pub cleanup_interval_seconds: Option<u64>,
    pub grant_expiry_delay_seconds: Option<u64>,
    pub broadcast_batch_size: Option<u32>,
    pub max_parsing_retries: Option<u32>,
    pub retention_days: Option<u32>,
    pub monitoring_interval_seconds: Option<u64>,
}

/// Rules seeded on first run and served before any configuration is loaded.
pub fn default_rules() -> Vec<ParsingRule> {
    vec![
        ParsingRule::new(1, "Fisher", r"Coins:\s*\+(\d+)", Decimal::new(15, 1), "coins"),
        ParsingRule::new(2, "Cards", r"Points:\s*\+(\d+)", Decimal::from(2), "points"),
        ParsingRule::new(3, "Miner", r"Gold:\s*\+(\d+)", Decimal::ONE, "gold"),
    ]
}

/// Immutable view of the full configuration at one point in time. Published
/// behind an `Arc` and never mutated after construction: consumers holding an
/// old snapshot keep reading it untouched while a new one is swapped in.
#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
    /// All rules, ascending by id. Matching walks this order.
    pub parsing_rules: Vec<ParsingRule>,
    pub settings: SnapshotSettings,
    pub loaded_at: DateTime<Utc>,
}

impl ConfigurationSnapshot {
    /// Build a snapshot from raw parts: sorts rules by id and compiles their
    /// patterns. A pattern that fails to compile is left uncompiled (it can
    /// never match) and is reported by validation instead.
    pub fn from_parts(mut rules: Vec<ParsingRule>, settings: SnapshotSettings) -> Self {
        rules.sort_by_key(|r| r.id);
        for rule in &mut rules {
            if let Err(e) = rule.compile() {
                warn!("{e}");
            }
        }
        Self {
            parsing_rules: rules,
            settings,
            loaded_at: Utc::now(),
        }
    }

    /// The snapshot served when nothing has ever been loaded.
    pub fn built_in_default() -> Self {
        Self::from_parts(default_rules(), SnapshotSettings::default())
    }

    pub fn active_rules(&self) -> impl Iterator<Item = &ParsingRule> {
        self.parsing_rules.iter().filter(|r| r.active)
    }

    /// Lowest-id active rule registered for `source_name`, if any.
    pub fn first_active_rule_for(&self, source_name: &str) -> Option<&ParsingRule> {
        self.active_rules()
            .find(|r| r.source_name.eq_ignore_ascii_case(source_name))
    }

    pub fn rule_count(&self) -> usize {
        self.parsing_rules.len()
    }

    pub fn active_rule_count(&self) -> usize {
        self.active_rules().count()
    }
}

/// Portable, versioned dump of a snapshot. Rules are included on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigExport {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub settings: SnapshotSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<ParsingRule>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub created_by: String,
}

/// On-disk backup layout: gzip-compressed JSON of this document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDocument {
    pub metadata: BackupMetadata,
    pub export: ConfigExport,
}

/// Point-in-time counters for operator dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigStats {
    pub rule_count: usize,
    pub active_rule_count: usize,
    pub admin_count: usize,
    pub cleanup_interval_seconds: u64,
    pub monitoring_interval_seconds: u64,
    pub retention_days: u32,
    pub last_reload: Option<DateTime<Utc>>,
}

/// Validates whole candidate snapshots before they are activated. A candidate
/// either passes completely or the running configuration stays as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// Every violation in the candidate, empty when it is safe to activate.
    pub fn validate_snapshot(&self, candidate: &ConfigurationSnapshot) -> Vec<String> {
        let mut errors = Vec::new();
        if candidate.parsing_rules.is_empty() {
            errors.push("configuration must contain at least one parsing rule".to_string());
        }
        for rule in &candidate.parsing_rules {
            errors.extend(self.validate_rule(rule));
        }
        errors.extend(self.validate_settings(&candidate.settings));
        errors
    }

    pub fn validate_rule(&self, rule: &ParsingRule) -> Vec<String> {
        let owner = format!("rule '{}'", rule.source_name);
        let mut errors = Vec::new();
        if rule.source_name.trim().is_empty() {
            errors.push(format!("rule {}: source name must not be empty", rule.id));
        }
        if rule.currency_type.trim().is_empty() {
            errors.push(format!("{owner}: currency type must not be empty"));
        }
        if rule.multiplier <= Decimal::ZERO {
            errors.push(format!("{owner}: multiplier must be greater than zero"));
        }
        errors.extend(self.validate_pattern(&owner, &rule.pattern));
        errors
    }

    /// The pattern must compile and capture the amount in group 1.
    pub fn validate_pattern(&self, owner: &str, pattern: &str) -> Vec<String> {
        match ParsingRule::build_regex(pattern) {
            Ok(regex) if regex.captures_len() < 2 => {
                vec![format!("{owner}: pattern needs a capture group for the amount")]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("{owner}: invalid pattern: {e}")],
        }
    }

    pub fn validate_settings(&self, settings: &SnapshotSettings) -> Vec<String> {
        let mut errors = Vec::new();
        if settings.admin_refs.is_empty() {
            errors.push("at least one admin reference is required".to_string());
        }
        if settings.admin_refs.iter().any(|r| *r <= 0) {
            errors.push("admin references must be positive account ids".to_string());
        }
        if settings.cleanup_interval_seconds < MIN_CLEANUP_INTERVAL_SECONDS {
            errors.push(format!(
                "cleanup interval must be at least {MIN_CLEANUP_INTERVAL_SECONDS} seconds"
            ));
        }
        if !(MIN_GRANT_EXPIRY_DELAY_SECONDS..=MAX_GRANT_EXPIRY_DELAY_SECONDS)
            .contains(&settings.grant_expiry_delay_seconds)
        {
            errors.push(format!(
                "grant expiry delay must be between {MIN_GRANT_EXPIRY_DELAY_SECONDS} and \
                 {MAX_GRANT_EXPIRY_DELAY_SECONDS} seconds"
            ));
        }
        if !(1..=MAX_BROADCAST_BATCH_SIZE).contains(&settings.broadcast_batch_size) {
            errors.push(format!(
                "broadcast batch size must be between 1 and {MAX_BROADCAST_BATCH_SIZE}"
            ));
        }
        if !(1..=MAX_PARSING_RETRY_LIMIT).contains(&settings.max_parsing_retries) {
            errors.push(format!(
                "max parsing retries must be between 1 and {MAX_PARSING_RETRY_LIMIT}"
            ));
        }
        if settings.retention_days == 0 {
            errors.push("transaction retention must be at least one day".to_string());
        }
        if settings.monitoring_interval_seconds == 0 {
            errors.push("monitoring interval must be at least one second".to_string());
        }
        errors
    }
}

/// Owns the published snapshot and every way it can change: reload from the
/// store, rule add/update, import, and backup restore. A reload is
/// all-or-nothing; on the very first load an invalid candidate is installed
/// anyway so the process always has *some* configuration, with the
/// violations retained for operators.
#[derive(Clone)]
pub struct ConfigurationManager {
    store: Arc<RewardStore>,
    config_dir: PathBuf,
    current: Arc<RwLock<Option<Arc<ConfigurationSnapshot>>>>,
    validation_errors: Arc<RwLock<Vec<String>>>,
    last_reload: Arc<RwLock<Option<DateTime<Utc>>>>,
    change_notifier: broadcast::Sender<ConfigChangeEvent>,
    validator: ConfigValidator,
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,
    last_watch_reload: Arc<RwLock<Instant>>,
}

impl ConfigurationManager {
    pub fn new(store: Arc<RewardStore>, config_dir: impl Into<PathBuf>) -> Self {
        let (change_notifier, _) = broadcast::channel(100);
        Self {
            store,
            config_dir: config_dir.into(),
            current: Arc::new(RwLock::new(None)),
            validation_errors: Arc::new(RwLock::new(Vec::new())),
            last_reload: Arc::new(RwLock::new(None)),
            change_notifier,
            validator: ConfigValidator::new(),
            watchers: Arc::new(RwLock::new(Vec::new())),
            last_watch_reload: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Create directories, seed default rules into an empty store, perform
    /// the first reload and start the settings file watcher. Storage being
    /// unreachable is degraded to warnings; only a broken filesystem fails.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .with_context(|| format!("creating {}", self.config_dir.display()))?;
        tokio::fs::create_dir_all(self.backups_dir())
            .await
            .context("creating backup directory")?;

        match self.store.count_rules().await {
            Ok(0) => self.seed_default_rules().await,
            Ok(n) => debug!("store holds {n} parsing rules, skipping seed"),
            Err(e) => warn!("could not inspect rule store during startup: {e}"),
        }

        let (ok, errors) = self.reload().await;
        if !ok {
            warn!(
                "initial configuration load reported {} issue(s); see validation_errors()",
                errors.len()
            );
        }

        if let Err(e) = self.setup_file_watcher().await {
            warn!("settings file watcher unavailable, hot reload is operator-triggered only: {e:#}");
        }

        info!(
            "configuration manager initialized (config dir: {})",
            self.config_dir.display()
        );
        Ok(())
    }

    /// The current snapshot. Never fails: before the first load this serves
    /// the built-in defaults.
    pub async fn get_configuration(&self) -> Arc<ConfigurationSnapshot> {
        if let Some(snapshot) = self.current.read().await.as_ref() {
            return Arc::clone(snapshot);
        }
        debug!("no configuration loaded yet, serving built-in defaults");
        Arc::new(ConfigurationSnapshot::built_in_default())
    }

    /// Re-read rules and settings from the store and atomically swap in a new
    /// snapshot. Returns whether the candidate was activated cleanly plus any
    /// violations found. On failure the previous snapshot stays active,
    /// except on the very first load where the candidate is installed anyway.
    pub async fn reload(&self) -> (bool, Vec<String>) {
        let candidate = match self.load_candidate().await {
            Ok(candidate) => candidate,
            Err(e) => {
                let errors = vec![format!("failed to read configuration from storage: {e}")];
                if self.current.read().await.is_some() {
                    warn!("reload failed, previous configuration remains active: {e}");
                    *self.validation_errors.write().await = errors.clone();
                    let _ = self
                        .change_notifier
                        .send(ConfigChangeEvent::ReloadRejected { errors: errors.clone() });
                    return (false, errors);
                }
                warn!("storage unreachable on first load, installing built-in defaults: {e}");
                *self.current.write().await =
                    Some(Arc::new(ConfigurationSnapshot::built_in_default()));
                *self.validation_errors.write().await = errors.clone();
                *self.last_reload.write().await = Some(Utc::now());
                return (false, errors);
            }
        };

        let errors = self.validator.validate_snapshot(&candidate);
        if errors.is_empty() {
            let rule_count = candidate.rule_count();
            *self.current.write().await = Some(Arc::new(candidate));
            *self.validation_errors.write().await = Vec::new();
            *self.last_reload.write().await = Some(Utc::now());
            let _ = self
                .change_notifier
                .send(ConfigChangeEvent::Reloaded { rule_count });
            info!("configuration reloaded: {rule_count} rules");
            return (true, Vec::new());
        }

        let mut current = self.current.write().await;
        if current.is_none() {
            // First load: install the invalid candidate so the process has a
            // configuration, and keep the violations visible to operators.
            warn!(
                "first configuration load has {} violation(s); installing candidate anyway",
                errors.len()
            );
            *current = Some(Arc::new(candidate));
            *self.last_reload.write().await = Some(Utc::now());
        } else {
            warn!(
                "configuration rejected ({} violation(s)); previous configuration remains active",
                errors.len()
            );
        }
        drop(current);

        *self.validation_errors.write().await = errors.clone();
        let _ = self
            .change_notifier
            .send(ConfigChangeEvent::ReloadRejected { errors: errors.clone() });
        (false, errors)
    }

    /// Run the validator against an arbitrary candidate without touching the
    /// running configuration.
    pub fn validate(&self, candidate: &ConfigurationSnapshot) -> Vec<String> {
        self.validator.validate_snapshot(candidate)
    }

    /// Violations retained from the most recent failed reload or first-load
    /// install. Cleared by the next successful reload.
    pub async fn validation_errors(&self) -> Vec<String> {
        self.validation_errors.read().await.clone()
    }

    pub async fn last_reload(&self) -> Option<DateTime<Utc>> {
        *self.last_reload.read().await
    }

    /// Add a new parsing rule and reload. Returns false when an identical
    /// (source, pattern) pair already exists; an invalid rule is an error.
    pub async fn add_rule(
        &self,
        source_name: &str,
        pattern: &str,
        multiplier: Decimal,
        currency_type: &str,
    ) -> Result<bool> {
        let candidate = ParsingRule::new(0, source_name, pattern, multiplier, currency_type);
        let violations = self.validator.validate_rule(&candidate);
        if !violations.is_empty() {
            bail!("rule rejected: {}", violations.join("; "));
        }

        let existing = self
            .store
            .list_all_rules()
            .await
            .context("listing rules for duplicate check")?;
        if existing
            .iter()
            .any(|r| r.source_name == source_name && r.pattern == pattern)
        {
            debug!("rule for ('{source_name}', '{pattern}') already exists");
            return Ok(false);
        }

        let id = self
            .store
            .insert_rule(&candidate)
            .await
            .context("inserting rule")?;
        info!("added parsing rule {id} for source '{source_name}'");
        let _ = self.change_notifier.send(ConfigChangeEvent::RuleAdded {
            id,
            source_name: source_name.to_string(),
        });
        self.reload().await;
        Ok(true)
    }

    /// Apply field changes to an existing rule and reload. Returns false for
    /// an unknown id or an empty change set; invalid changes are an error.
    pub async fn update_rule(&self, id: i64, changes: RuleChanges) -> Result<bool> {
        if changes.is_empty() {
            debug!("update for rule {id} carried no changes");
            return Ok(false);
        }

        let mut violations = Vec::new();
        let owner = format!("rule {id}");
        if let Some(pattern) = &changes.pattern {
            violations.extend(self.validator.validate_pattern(&owner, pattern));
        }
        if let Some(multiplier) = changes.multiplier {
            if multiplier <= Decimal::ZERO {
                violations.push(format!("{owner}: multiplier must be greater than zero"));
            }
        }
        if let Some(currency) = &changes.currency_type {
            if currency.trim().is_empty() {
                violations.push(format!("{owner}: currency type must not be empty"));
            }
        }
        if !violations.is_empty() {
            bail!("rule update rejected: {}", violations.join("; "));
        }

        let applied = self
            .store
            .update_rule(id, &changes)
            .await
            .context("updating rule")?;
        if !applied {
            debug!("update for unknown rule {id} rejected");
            return Ok(false);
        }

        info!("updated parsing rule {id}");
        let _ = self
            .change_notifier
            .send(ConfigChangeEvent::RuleUpdated { id });
        self.reload().await;
        Ok(true)
    }

    /// Versioned dump of the current snapshot, with rules when requested.
    pub async fn export_snapshot(&self, include_rules: bool) -> ConfigExport {
        let snapshot = self.get_configuration().await;
        ConfigExport {
            version: EXPORT_FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            settings: snapshot.settings.clone(),
            rules: include_rules.then(|| snapshot.parsing_rules.clone()),
        }
    }

    /// Validate an export and, when clean, persist it and reload. Settings are
    /// always taken from the export; the rule table is replaced only when
    /// `import_rules` is set and the export carries rules. Returns false when
    /// the export is rejected (nothing is changed in that case).
    pub async fn import_snapshot(&self, export: &ConfigExport, import_rules: bool) -> Result<bool> {
        if !export.version.starts_with("1.") {
            warn!("unsupported export version '{}'", export.version);
            return Ok(false);
        }

        let candidate_rules = match (&export.rules, import_rules) {
            (Some(rules), true) => rules.clone(),
            _ => self.get_configuration().await.parsing_rules.clone(),
        };
        let candidate =
            ConfigurationSnapshot::from_parts(candidate_rules, export.settings.clone());
        let errors = self.validator.validate_snapshot(&candidate);
        if !errors.is_empty() {
            warn!("import rejected with {} violation(s)", errors.len());
            for error in &errors {
                warn!("import: {error}");
            }
            return Ok(false);
        }

        let pairs = Self::settings_pairs(&export.settings).context("encoding imported settings")?;
        let rules_to_write = match (&export.rules, import_rules) {
            (Some(rules), true) => Some(rules.as_slice()),
            _ => None,
        };
        // One transaction, so settings and rules land together or not at all.
        self.store
            .apply_import(rules_to_write, &pairs)
            .await
            .context("persisting imported configuration")?;

        let (ok, errors) = self.reload().await;
        if !ok {
            // The store changed between persist and reload.
            warn!("reload after import reported violations: {errors:?}");
        }
        info!("configuration import applied (rules: {import_rules})");
        Ok(true)
    }

    /// Write a gzip-compressed JSON archive of the full configuration and
    /// return its backup id.
    pub async fn create_backup(&self, description: &str, created_by: &str) -> Result<String> {
        tokio::fs::create_dir_all(self.backups_dir())
            .await
            .context("creating backup directory")?;

        let id = uuid::Uuid::new_v4().to_string();
        let document = BackupDocument {
            metadata: BackupMetadata {
                id: id.clone(),
                created_at: Utc::now(),
                description: description.to_string(),
                created_by: created_by.to_string(),
            },
            export: self.export_snapshot(true).await,
        };

        let path = self.backup_path(&id);
        let json = serde_json::to_vec_pretty(&document).context("serializing backup")?;
        let file = std::fs::File::create(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&json).context("writing backup")?;
        encoder.finish().context("finishing backup")?;

        info!("created configuration backup {id} at {}", path.display());
        let _ = self
            .change_notifier
            .send(ConfigChangeEvent::BackupCreated { id: id.clone() });
        Ok(id)
    }

    /// Import the named backup wholesale (settings and rules). Returns false
    /// for an unknown backup id or a backup that fails validation.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<bool> {
        let path = self.backup_path(backup_id);
        if !path.exists() {
            warn!("backup {backup_id} not found");
            return Ok(false);
        }

        let document = Self::read_backup(&path)?;
        if !self.import_snapshot(&document.export, true).await? {
            return Ok(false);
        }

        info!("restored configuration backup {backup_id}");
        let _ = self.change_notifier.send(ConfigChangeEvent::BackupRestored {
            id: backup_id.to_string(),
        });
        Ok(true)
    }

    /// Metadata of every readable backup, newest first. Unreadable archives
    /// are skipped with a warning.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let backups_dir = self.backups_dir();
        if !backups_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&backups_dir)
            .await
            .context("reading backup directory")?;
        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("reading backup directory")?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json.gz") {
                continue;
            }
            match Self::read_backup(&path) {
                Ok(document) => backups.push(document.metadata),
                Err(e) => warn!("skipping unreadable backup {}: {e:#}", path.display()),
            }
        }

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// The manager's own health: storage reachable, snapshot valid, backup
    /// directory writable. Background jobs report through the scheduler, so
    /// `background_tasks_running` is always false here.
    pub async fn health_status(&self) -> HealthStatus {
        let mut errors = Vec::new();

        let storage_connected = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("storage unreachable: {e}"));
                false
            }
        };

        let retained = self.validation_errors.read().await.len();
        let snapshot_valid = retained == 0;
        if !snapshot_valid {
            errors.push(format!(
                "{retained} validation error(s) from the last failed reload"
            ));
        }

        let marker = self.backups_dir().join(".writecheck");
        let backups_writable = match tokio::fs::write(&marker, b"").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&marker).await;
                true
            }
            Err(e) => {
                errors.push(format!("backup directory not writable: {e}"));
                false
            }
        };

        let snapshot = self.get_configuration().await;
        HealthStatus {
            healthy: storage_connected && snapshot_valid && backups_writable,
            storage_connected,
            parsing_active: snapshot.active_rule_count() > 0,
            background_tasks_running: false,
            checked_at: Utc::now(),
            errors,
        }
    }

    pub async fn stats(&self) -> ConfigStats {
        let snapshot = self.get_configuration().await;
        ConfigStats {
            rule_count: snapshot.rule_count(),
            active_rule_count: snapshot.active_rule_count(),
            admin_count: snapshot.settings.admin_refs.len(),
            cleanup_interval_seconds: snapshot.settings.cleanup_interval_seconds,
            monitoring_interval_seconds: snapshot.settings.monitoring_interval_seconds,
            retention_days: snapshot.settings.retention_days,
            last_reload: self.last_reload().await,
        }
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    // ---- internals ----------------------------------------------------------

    fn backups_dir(&self) -> PathBuf {
        self.config_dir.join(BACKUPS_DIR)
    }

    fn backup_path(&self, id: &str) -> PathBuf {
        self.backups_dir().join(format!("backup_{id}.json.gz"))
    }

    fn read_backup(path: &Path) -> Result<BackupDocument> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut decoder = GzDecoder::new(file);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .context("decompressing backup")?;
        serde_json::from_str(&json).context("parsing backup document")
    }

    async fn seed_default_rules(&self) {
        let mut seeded = 0usize;
        for rule in default_rules() {
            match self.store.insert_rule(&rule).await {
                Ok(_) => seeded += 1,
                Err(e) => warn!("failed to seed default rule for '{}': {e}", rule.source_name),
            }
        }
        info!("seeded {seeded} default parsing rules");
    }

    async fn load_candidate(&self) -> Result<ConfigurationSnapshot, StorageError> {
        let rules = self.store.list_all_rules().await?;
        let settings = self.load_settings().await?;
        Ok(ConfigurationSnapshot::from_parts(rules, settings))
    }

    /// Assemble settings with store values first, then the override file,
    /// then built-in defaults. A malformed stored value is skipped with a
    /// warning rather than failing the reload.
    async fn load_settings(&self) -> Result<SnapshotSettings, StorageError> {
        let overrides = self.load_settings_overrides().await.unwrap_or_default();
        let defaults = SnapshotSettings::default();

        Ok(SnapshotSettings {
            admin_refs: match self.stored_json::<Vec<i64>>(keys::ADMIN_REFS).await? {
                Some(value) => value,
                None => overrides.admin_refs.unwrap_or(defaults.admin_refs),
            },
            cleanup_interval_seconds: match self
                .stored_parsed::<u64>(keys::CLEANUP_INTERVAL_SECONDS)
                .await?
            {
                Some(value) => value,
                None => overrides
                    .cleanup_interval_seconds
                    .unwrap_or(defaults.cleanup_interval_seconds),
            },
            grant_expiry_delay_seconds: match self
                .stored_parsed::<u64>(keys::GRANT_EXPIRY_DELAY_SECONDS)
                .await?
            {
                Some(value) => value,
                None => overrides
                    .grant_expiry_delay_seconds
                    .unwrap_or(defaults.grant_expiry_delay_seconds),
            },
            broadcast_batch_size: match self
                .stored_parsed::<u32>(keys::BROADCAST_BATCH_SIZE)
                .await?
            {
                Some(value) => value,
                None => overrides
                    .broadcast_batch_size
                    .unwrap_or(defaults.broadcast_batch_size),
            },
            max_parsing_retries: match self
                .stored_parsed::<u32>(keys::MAX_PARSING_RETRIES)
                .await?
            {
                Some(value) => value,
                None => overrides
                    .max_parsing_retries
                    .unwrap_or(defaults.max_parsing_retries),
            },
            retention_days: match self.stored_parsed::<u32>(keys::RETENTION_DAYS).await? {
                Some(value) => value,
                None => overrides.retention_days.unwrap_or(defaults.retention_days),
            },
            monitoring_interval_seconds: match self
                .stored_parsed::<u64>(keys::MONITORING_INTERVAL_SECONDS)
                .await?
            {
                Some(value) => value,
                None => overrides
                    .monitoring_interval_seconds
                    .unwrap_or(defaults.monitoring_interval_seconds),
            },
        })
    }

    async fn load_settings_overrides(&self) -> Option<SettingsOverrides> {
        let path = self.config_dir.join(SETTINGS_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match serde_yaml::from_str(&raw) {
            Ok(overrides) => {
                debug!("loaded settings overrides from {}", path.display());
                Some(overrides)
            }
            Err(e) => {
                warn!("ignoring malformed {}: {e}", path.display());
                None
            }
        }
    }

    async fn stored_parsed<T: std::str::FromStr>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        Ok(self.store.get_setting(key).await?.and_then(|raw| {
            match raw.parse::<T>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring malformed stored setting '{key}': '{raw}'");
                    None
                }
            }
        }))
    }

    async fn stored_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        Ok(self.store.get_setting(key).await?.and_then(|raw| {
            match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("ignoring malformed stored setting '{key}': {e}");
                    None
                }
            }
        }))
    }

    /// Flatten settings into the key/value rows the store persists.
    fn settings_pairs(
        settings: &SnapshotSettings,
    ) -> Result<Vec<(&'static str, String)>, StorageError> {
        let admin_refs = serde_json::to_string(&settings.admin_refs)
            .map_err(|e| StorageError::Corrupt(format!("admin refs: {e}")))?;
        Ok(vec![
            (keys::ADMIN_REFS, admin_refs),
            (
                keys::CLEANUP_INTERVAL_SECONDS,
                settings.cleanup_interval_seconds.to_string(),
            ),
            (
                keys::GRANT_EXPIRY_DELAY_SECONDS,
                settings.grant_expiry_delay_seconds.to_string(),
            ),
            (
                keys::BROADCAST_BATCH_SIZE,
                settings.broadcast_batch_size.to_string(),
            ),
            (
                keys::MAX_PARSING_RETRIES,
                settings.max_parsing_retries.to_string(),
            ),
            (keys::RETENTION_DAYS, settings.retention_days.to_string()),
            (
                keys::MONITORING_INTERVAL_SECONDS,
                settings.monitoring_interval_seconds.to_string(),
            ),
        ])
    }

    /// Watch the config directory for settings file edits and reload with a
    /// debounce. Watcher failure degrades hot reload, nothing else.
    async fn setup_file_watcher(&self) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(100);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("failed to forward file watch event: {e}");
                    }
                }
                Err(e) => error!("file watch error: {e}"),
            })?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;
        self.watchers.write().await.push(watcher);

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let touched_settings = event.paths.iter().any(|p| {
                    matches!(p.file_name().and_then(|n| n.to_str()), Some(SETTINGS_FILE))
                });
                if !touched_settings {
                    continue;
                }

                {
                    let now = Instant::now();
                    let mut last = manager.last_watch_reload.write().await;
                    if now.duration_since(*last) < WATCH_DEBOUNCE {
                        continue;
                    }
                    *last = now;
                }

                info!("settings override file changed, reloading configuration");
                let (ok, errors) = manager.reload().await;
                if !ok {
                    warn!("reload after settings change failed: {errors:?}");
                }
            }
        });

        debug!(
            "configuration file watcher active on {}",
            self.config_dir.display()
        );
        Ok(())
    }
}
