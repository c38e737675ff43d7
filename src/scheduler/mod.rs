// src/scheduler/mod.rs - background cleanup and health monitoring tasks

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::config::ConfigurationManager;
use crate::storage::RewardStore;
use crate::types::{CleanupResult, HealthStatus, SchedulerStatus};

/// Sweeps grants whose expiry (plus the configured grace period) has passed.
/// A trait seam so deployments can layer revocation side effects on top of
/// the plain store delete.
#[async_trait::async_trait]
pub trait GrantSweeper: Send + Sync {
    async fn expire_due_grants(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

/// Default sweeper: deletes due grants straight from the store.
pub struct StoreGrantSweeper {
    store: Arc<RewardStore>,
}

impl StoreGrantSweeper {
    pub fn new(store: Arc<RewardStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl GrantSweeper for StoreGrantSweeper {
    async fn expire_due_grants(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.store.expire_due_grants(cutoff).await?)
    }
}

/// Runs the periodic cleanup and health monitoring loops. `start` and `stop`
/// are idempotent; a stop signal is observed at the next loop turn, so an
/// in-flight pass always finishes before its task exits.
pub struct MaintenanceScheduler {
    store: Arc<RewardStore>,
    config: Arc<ConfigurationManager>,
    grant_sweeper: Arc<dyn GrantSweeper>,
    running: Arc<AtomicBool>,
    cleanup_alive: Arc<AtomicBool>,
    monitoring_alive: Arc<AtomicBool>,
    cleanup_interval: Arc<AtomicU64>,
    monitoring_interval: Arc<AtomicU64>,
    shutdown: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
    last_health: Arc<RwLock<Option<HealthStatus>>>,
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<RewardStore>, config: Arc<ConfigurationManager>) -> Self {
        let sweeper = StoreGrantSweeper::new(Arc::clone(&store));
        let defaults = crate::config::SnapshotSettings::default();
        Self {
            store,
            config,
            grant_sweeper: Arc::new(sweeper),
            running: Arc::new(AtomicBool::new(false)),
            cleanup_alive: Arc::new(AtomicBool::new(false)),
            monitoring_alive: Arc::new(AtomicBool::new(false)),
            cleanup_interval: Arc::new(AtomicU64::new(defaults.cleanup_interval_seconds)),
            monitoring_interval: Arc::new(AtomicU64::new(defaults.monitoring_interval_seconds)),
            shutdown: Arc::new(RwLock::new(None)),
            tasks: Arc::new(RwLock::new(Vec::new())),
            last_health: Arc::new(RwLock::new(None)),
        }
    }

    /// Replace the grant sweeper, e.g. to revoke external privileges as part
    /// of the sweep.
    pub fn with_grant_sweeper(mut self, sweeper: Arc<dyn GrantSweeper>) -> Self {
        self.grant_sweeper = sweeper;
        self
    }

    /// Spawn the cleanup and monitoring loops. Calling `start` while already
    /// running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("maintenance scheduler already running");
            return;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let cleanup_rx = shutdown_tx.subscribe();
        let monitoring_rx = shutdown_tx.subscribe();
        *self.shutdown.write().await = Some(shutdown_tx);

        self.cleanup_alive.store(true, Ordering::SeqCst);
        self.monitoring_alive.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.write().await;
        tasks.push(self.spawn_cleanup_loop(cleanup_rx));
        tasks.push(self.spawn_monitoring_loop(monitoring_rx));
        drop(tasks);

        info!("maintenance scheduler started");
    }

    /// Signal both loops and wait for them to finish. An in-flight pass runs
    /// to completion first. Calling `stop` while stopped is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown.write().await.take() {
            let _ = tx.send(());
        }

        let mut tasks = self.tasks.write().await;
        for handle in tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!("background task ended abnormally: {e}");
            }
        }
        info!("maintenance scheduler stopped");
    }

    /// Current state without touching storage or configuration.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            cleanup_interval_seconds: self.cleanup_interval.load(Ordering::SeqCst),
            monitoring_interval_seconds: self.monitoring_interval.load(Ordering::SeqCst),
            cleanup_job_alive: self.cleanup_alive.load(Ordering::SeqCst),
            monitoring_job_alive: self.monitoring_alive.load(Ordering::SeqCst),
            last_status_check: Utc::now(),
        }
    }

    /// Report from the most recent monitoring pass, if any ran yet.
    pub async fn last_health(&self) -> Option<HealthStatus> {
        self.last_health.read().await.clone()
    }

    /// Run one cleanup pass immediately, outside the periodic schedule.
    pub async fn run_cleanup_once(&self) -> CleanupResult {
        cleanup_pass(&self.store, &self.config, self.grant_sweeper.as_ref()).await
    }

    /// Run one health check immediately and record it as the latest report.
    pub async fn run_health_check_once(&self) -> HealthStatus {
        let health = health_check(
            &self.store,
            &self.config,
            self.running.load(Ordering::SeqCst),
        )
        .await;
        *self.last_health.write().await = Some(health.clone());
        health
    }

    fn spawn_cleanup_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let sweeper = Arc::clone(&self.grant_sweeper);
        let alive = Arc::clone(&self.cleanup_alive);
        let interval_gauge = Arc::clone(&self.cleanup_interval);
        tokio::spawn(async move {
            loop {
                let secs = config
                    .get_configuration()
                    .await
                    .settings
                    .cleanup_interval_seconds
                    .max(1);
                interval_gauge.store(secs, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        // The pass runs inside this arm, so a shutdown signal
                        // never cancels it mid-flight.
                        let result = cleanup_pass(&store, &config, sweeper.as_ref()).await;
                        if result.is_clean() {
                            info!("{}", result.summary);
                        } else {
                            warn!("{}", result.summary);
                            for error in &result.errors {
                                warn!("cleanup: {error}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            alive.store(false, Ordering::SeqCst);
            debug!("cleanup task stopped");
        })
    }

    fn spawn_monitoring_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let running = Arc::clone(&self.running);
        let alive = Arc::clone(&self.monitoring_alive);
        let interval_gauge = Arc::clone(&self.monitoring_interval);
        let last_health = Arc::clone(&self.last_health);
        tokio::spawn(async move {
            loop {
                let secs = config
                    .get_configuration()
                    .await
                    .settings
                    .monitoring_interval_seconds
                    .max(1);
                interval_gauge.store(secs, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        let health =
                            health_check(&store, &config, running.load(Ordering::SeqCst)).await;
                        if health.healthy {
                            debug!("health check passed");
                        } else {
                            warn!("health check failed: {:?}", health.errors);
                        }
                        *last_health.write().await = Some(health);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            alive.store(false, Ordering::SeqCst);
            debug!("monitoring task stopped");
        })
    }
}

/// One full cleanup pass: sweep grants past their expiry plus the grace
/// period, drop expired account flags and prune transactions older than the
/// retention window. Each step failing is recorded and the rest still run.
async fn cleanup_pass(
    store: &RewardStore,
    config: &ConfigurationManager,
    sweeper: &dyn GrantSweeper,
) -> CleanupResult {
    let started = Utc::now();
    let settings = config.get_configuration().await.settings.clone();
    let mut result = CleanupResult::default();

    // Clamp to the validated ceiling so the i64 cast cannot wrap.
    let delay = settings
        .grant_expiry_delay_seconds
        .min(crate::config::MAX_GRANT_EXPIRY_DELAY_SECONDS) as i64;
    let grant_cutoff = started - ChronoDuration::seconds(delay);
    match sweeper.expire_due_grants(grant_cutoff).await {
        Ok(n) => result.cleaned_grants += n,
        Err(e) => result.errors.push(format!("grant expiry failed: {e}")),
    }

    match store.expire_account_flags(started).await {
        Ok(n) => result.cleaned_grants += n,
        Err(e) => result.errors.push(format!("flag expiry failed: {e}")),
    }

    let retention_cutoff = started - ChronoDuration::days(i64::from(settings.retention_days));
    match store.prune_transactions_before(retention_cutoff).await {
        Ok(n) => result.cleaned_records += n,
        Err(e) => result.errors.push(format!("retention pruning failed: {e}")),
    }

    result.finalize();
    result
}

/// One monitoring pass: storage reachability plus whether parsing is live.
/// Parsing counts as active with at least one active rule, or failing that,
/// with any transaction recorded in the last hour. `tasks_running` is the
/// caller's view of the scheduler loops and is reported as-is.
async fn health_check(
    store: &RewardStore,
    config: &ConfigurationManager,
    tasks_running: bool,
) -> HealthStatus {
    let mut errors = Vec::new();

    let storage_connected = match store.ping().await {
        Ok(()) => true,
        Err(e) => {
            errors.push(format!("storage unreachable: {e}"));
            false
        }
    };

    let snapshot = config.get_configuration().await;
    let parsing_active = if snapshot.active_rule_count() > 0 {
        true
    } else {
        match store
            .recent_transaction_count(Utc::now() - ChronoDuration::hours(1))
            .await
        {
            Ok(n) => n > 0,
            Err(e) => {
                errors.push(format!("could not count recent transactions: {e}"));
                false
            }
        }
    };
    if !parsing_active {
        errors.push("no active parsing rules and no transactions in the last hour".to_string());
    }

    HealthStatus {
        healthy: storage_connected && parsing_active && errors.is_empty(),
        storage_connected,
        parsing_active,
        background_tasks_running: tasks_running,
        checked_at: Utc::now(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<RewardStore>, Arc<ConfigurationManager>) {
        let store = Arc::new(
            RewardStore::connect(dir.path().join("scheduler.db"))
                .await
                .unwrap(),
        );
        store.migrate().await.unwrap();
        let config = Arc::new(ConfigurationManager::new(
            Arc::clone(&store),
            dir.path().join("config"),
        ));
        config.initialize().await.unwrap();
        (store, config)
    }

    #[test_log::test(tokio::test)]
    async fn start_and_stop_are_idempotent_and_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let scheduler = MaintenanceScheduler::new(store, config);

        assert!(!scheduler.status().is_running);

        scheduler.start().await;
        let status = scheduler.status();
        assert!(status.is_running);
        assert!(status.cleanup_job_alive);
        assert!(status.monitoring_job_alive);
        assert_eq!(status.cleanup_interval_seconds, 300);
        assert_eq!(status.monitoring_interval_seconds, 60);

        // A second start must not spawn more tasks.
        scheduler.start().await;
        assert_eq!(scheduler.tasks.read().await.len(), 2);

        // Both loops sit in long sleeps; stop must still return promptly.
        tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
            .await
            .unwrap();
        let status = scheduler.status();
        assert!(!status.is_running);
        assert!(!status.cleanup_job_alive);
        assert!(!status.monitoring_job_alive);

        // Stopping again is a no-op.
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn cleanup_sweeps_grants_flags_and_old_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let scheduler = MaintenanceScheduler::new(Arc::clone(&store), config);

        let now = Utc::now();
        store.upsert_account(7, "vip holder").await.unwrap();
        // Expired an hour ago: well past the 60 second grace period.
        store
            .insert_grant(7, "vip", now - ChronoDuration::hours(2), now - ChronoDuration::hours(1))
            .await
            .unwrap();
        // Expired seconds ago: still inside the grace period, must survive.
        store
            .insert_grant(7, "mod", now - ChronoDuration::hours(1), now - ChronoDuration::seconds(10))
            .await
            .unwrap();
        // Not expired at all.
        store
            .insert_grant(7, "sub", now, now + ChronoDuration::hours(1))
            .await
            .unwrap();
        store
            .set_account_flag(7, "muted", now - ChronoDuration::minutes(5))
            .await
            .unwrap();

        store
            .record_transaction(
                None,
                "Fisher",
                rust_decimal::Decimal::from(10),
                rust_decimal::Decimal::from(15),
                "coins",
                now - ChronoDuration::days(100),
                "old haul",
            )
            .await
            .unwrap();
        store
            .record_transaction(
                None,
                "Fisher",
                rust_decimal::Decimal::from(10),
                rust_decimal::Decimal::from(15),
                "coins",
                now - ChronoDuration::days(10),
                "recent haul",
            )
            .await
            .unwrap();

        let result = scheduler.run_cleanup_once().await;
        assert!(result.is_clean(), "errors: {:?}", result.errors);
        // One grant plus one flag.
        assert_eq!(result.cleaned_grants, 2);
        assert_eq!(result.cleaned_records, 1);
        assert!(result.summary.contains("cleanup ok"));

        // The in-grace grant and the live grant are both still present.
        let remaining = store
            .list_active_grants(now - ChronoDuration::hours(3))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            store
                .recent_transaction_count(chrono::DateTime::UNIX_EPOCH)
                .await
                .unwrap(),
            1
        );
    }

    struct RecordingSweeper {
        cutoffs: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl GrantSweeper for RecordingSweeper {
        async fn expire_due_grants(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
            self.cutoffs.lock().unwrap().push(cutoff);
            Ok(3)
        }
    }

    #[tokio::test]
    async fn sweeper_receives_the_grace_adjusted_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let sweeper = Arc::new(RecordingSweeper {
            cutoffs: Mutex::new(Vec::new()),
        });
        let scheduler =
            MaintenanceScheduler::new(store, config).with_grant_sweeper(sweeper.clone());

        let before = Utc::now();
        let result = scheduler.run_cleanup_once().await;
        assert_eq!(result.cleaned_grants, 3);

        let cutoffs = sweeper.cutoffs.lock().unwrap();
        assert_eq!(cutoffs.len(), 1);
        // Default grace period is 60 seconds.
        let lag = (before - cutoffs[0]).num_seconds();
        assert!((59..=61).contains(&lag), "unexpected cutoff lag {lag}s");
    }

    struct FailingSweeper;

    #[async_trait::async_trait]
    impl GrantSweeper for FailingSweeper {
        async fn expire_due_grants(&self, _cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
            anyhow::bail!("revocation backend offline")
        }
    }

    #[tokio::test]
    async fn cleanup_continues_past_a_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let scheduler = MaintenanceScheduler::new(Arc::clone(&store), config)
            .with_grant_sweeper(Arc::new(FailingSweeper));

        let now = Utc::now();
        store.upsert_account(7, "vip holder").await.unwrap();
        store
            .set_account_flag(7, "muted", now - ChronoDuration::minutes(5))
            .await
            .unwrap();

        let result = scheduler.run_cleanup_once().await;
        assert!(!result.is_clean());
        assert!(result.errors[0].contains("grant expiry failed"));
        // The flag sweep still ran.
        assert_eq!(result.cleaned_grants, 1);
        assert!(result.summary.contains("error(s)"));
    }

    #[tokio::test]
    async fn health_check_tracks_storage_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let scheduler = MaintenanceScheduler::new(Arc::clone(&store), config);

        assert!(scheduler.last_health().await.is_none());

        let health = scheduler.run_health_check_once().await;
        assert!(health.healthy);
        assert!(health.storage_connected);
        assert!(health.parsing_active);
        // Nothing was started, and the report must not claim otherwise.
        assert!(!health.background_tasks_running);
        assert!(health.errors.is_empty());
        assert!(scheduler.last_health().await.is_some());

        store.close().await;
        let health = scheduler.run_health_check_once().await;
        assert!(!health.healthy);
        assert!(!health.storage_connected);
        assert!(!health.errors.is_empty());
    }

    #[tokio::test]
    async fn on_demand_health_reports_real_task_state() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config) = setup(&dir).await;
        let scheduler = MaintenanceScheduler::new(store, config);

        assert!(
            !scheduler
                .run_health_check_once()
                .await
                .background_tasks_running
        );

        scheduler.start().await;
        assert!(
            scheduler
                .run_health_check_once()
                .await
                .background_tasks_running
        );

        scheduler.stop().await;
        let health = scheduler.run_health_check_once().await;
        assert!(!health.background_tasks_running);
        // The cached report tracks the latest call, not the startup state.
        assert!(
            !scheduler
                .last_health()
                .await
                .unwrap()
                .background_tasks_running
        );
    }

    #[tokio::test]
    async fn oversized_grace_delay_cannot_wrap_the_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            RewardStore::connect(dir.path().join("scheduler.db"))
                .await
                .unwrap(),
        );
        store.migrate().await.unwrap();
        // A stored delay beyond any sane bound, planted before the first
        // load so the bootstrap path installs it with retained errors.
        store
            .set_setting("grant_expiry_delay_seconds", &u64::MAX.to_string())
            .await
            .unwrap();
        let config = Arc::new(ConfigurationManager::new(
            Arc::clone(&store),
            dir.path().join("config"),
        ));
        config.initialize().await.unwrap();
        assert!(!config.validation_errors().await.is_empty());

        let scheduler = MaintenanceScheduler::new(Arc::clone(&store), config);

        let now = Utc::now();
        store.upsert_account(7, "vip holder").await.unwrap();
        store
            .insert_grant(7, "vip", now - ChronoDuration::hours(2), now - ChronoDuration::hours(1))
            .await
            .unwrap();

        let result = scheduler.run_cleanup_once().await;
        assert!(result.is_clean(), "errors: {:?}", result.errors);
        // The cutoff stays a year in the past; the hour-old expiry survives.
        assert_eq!(result.cleaned_grants, 0);
        assert_eq!(
            store
                .list_active_grants(now - ChronoDuration::hours(3))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
