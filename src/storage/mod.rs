// src/storage/mod.rs - SQLite-backed persistence for rules, transactions and accounts

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::types::{Account, Grant, ParsedTransaction, ParsingRule, RuleChanges, StorageError};

/// Durable store for parsing rules, reward transactions, accounts, grants and
/// scalar settings. All methods are safe to call concurrently; multi-step
/// writes run inside a single database transaction.
///
/// Decimal amounts are stored as text to keep their exact precision;
/// timestamps are stored as unix seconds.
#[derive(Debug, Clone)]
pub struct RewardStore {
    pool: SqlitePool,
}

impl RewardStore {
    /// Open (or create) the database at `path` and build the connection pool.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Corrupt(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        debug!("opened reward store at {}", path.display());
        Ok(Self { pool })
    }

    /// Direct pool access for schema extensions and ad-hoc queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create any missing tables and indexes. Idempotent; runs at startup.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS parsing_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_name TEXT NOT NULL,
                pattern TEXT NOT NULL,
                multiplier TEXT NOT NULL,
                currency_type TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS reward_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_ref INTEGER,
                source_name TEXT NOT NULL,
                original_amount TEXT NOT NULL,
                converted_amount TEXT NOT NULL,
                currency_type TEXT NOT NULL,
                parsed_at INTEGER NOT NULL,
                raw_text TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                last_activity INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS grants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                granted_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS account_flags (
                account_id INTEGER NOT NULL,
                flag TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, flag)
            )",
            "CREATE INDEX IF NOT EXISTS idx_parsing_rules_source
                ON parsing_rules(source_name)",
            "CREATE INDEX IF NOT EXISTS idx_reward_transactions_parsed_at
                ON reward_transactions(parsed_at)",
            "CREATE INDEX IF NOT EXISTS idx_reward_transactions_user
                ON reward_transactions(user_ref)",
            "CREATE INDEX IF NOT EXISTS idx_grants_expires
                ON grants(expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_account_flags_expires
                ON account_flags(expires_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("reward store schema ready");
        Ok(())
    }

    /// Cheap connectivity round-trip used by health checks.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Close the pool. Further calls fail with `StorageError::Unavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- parsing rules ------------------------------------------------------

    /// All rules ordered by ascending id. Patterns are not compiled here.
    pub async fn list_all_rules(&self) -> Result<Vec<ParsingRule>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, source_name, pattern, multiplier, currency_type, active
             FROM parsing_rules ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    /// Active rules only, ordered by ascending id.
    pub async fn list_active_rules(&self) -> Result<Vec<ParsingRule>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, source_name, pattern, multiplier, currency_type, active
             FROM parsing_rules WHERE active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    pub async fn count_rules(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parsing_rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert a rule and return its assigned id. The rule's own `id` field is
    /// ignored; the database allocates the next one.
    pub async fn insert_rule(&self, rule: &ParsingRule) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO parsing_rules (source_name, pattern, multiplier, currency_type, active)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&rule.source_name)
        .bind(&rule.pattern)
        .bind(rule.multiplier.to_string())
        .bind(&rule.currency_type)
        .bind(rule.active)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Apply the non-`None` fields of `changes` to rule `id`. Returns false
    /// when no rule with that id exists.
    pub async fn update_rule(&self, id: i64, changes: &RuleChanges) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT pattern, multiplier, currency_type, active FROM parsing_rules WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let pattern: String = changes
            .pattern
            .clone()
            .unwrap_or_else(|| row.get("pattern"));
        let multiplier: String = changes
            .multiplier
            .map(|m| m.to_string())
            .unwrap_or_else(|| row.get("multiplier"));
        let currency_type: String = changes
            .currency_type
            .clone()
            .unwrap_or_else(|| row.get("currency_type"));
        let active: bool = changes.active.unwrap_or_else(|| row.get("active"));

        sqlx::query(
            "UPDATE parsing_rules SET pattern = ?, multiplier = ?, currency_type = ?, active = ?
             WHERE id = ?",
        )
        .bind(&pattern)
        .bind(&multiplier)
        .bind(&currency_type)
        .bind(active)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Replace the whole rule table with `rules`, preserving their ids.
    /// Used by snapshot import and backup restore; all-or-nothing.
    pub async fn replace_rules(&self, rules: &[ParsingRule]) -> Result<(), StorageError> {
        self.apply_import(Some(rules), &[]).await
    }

    /// Persist an imported configuration in one transaction: upsert every
    /// settings pair and, when given, replace the rule table. A failure rolls
    /// back both, so an import is never left half-applied across a restart.
    pub async fn apply_import(
        &self,
        rules: Option<&[ParsingRule]>,
        settings: &[(&str, String)],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let updated_at = Utc::now().timestamp();
        for (key, value) in settings {
            sqlx::query(
                "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(*key)
            .bind(value.as_str())
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(rules) = rules {
            sqlx::query("DELETE FROM parsing_rules").execute(&mut *tx).await?;
            for rule in rules {
                sqlx::query(
                    "INSERT INTO parsing_rules (id, source_name, pattern, multiplier, currency_type, active)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(rule.id)
                .bind(&rule.source_name)
                .bind(&rule.pattern)
                .bind(rule.multiplier.to_string())
                .bind(&rule.currency_type)
                .bind(rule.active)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        if let Some(rules) = rules {
            debug!("rule table replaced with {} rules", rules.len());
        }
        Ok(())
    }

    // ---- settings -----------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- reward transactions ------------------------------------------------

    /// Persist one parsed reward and, when `user_ref` names a known account,
    /// credit that account with the integer-truncated converted amount in the
    /// same database transaction. Either both writes land or neither does.
    ///
    /// Returns the new transaction id and whether a balance was credited. An
    /// unknown `user_ref` stores the transaction unattributed (NULL ref).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_transaction(
        &self,
        user_ref: Option<i64>,
        source_name: &str,
        original_amount: Decimal,
        converted_amount: Decimal,
        currency_type: &str,
        parsed_at: DateTime<Utc>,
        raw_text: &str,
    ) -> Result<(i64, bool), StorageError> {
        let credit = converted_amount.trunc().to_i64().ok_or_else(|| {
            StorageError::Corrupt(format!(
                "converted amount {converted_amount} exceeds the integer credit range"
            ))
        })?;

        let mut tx = self.pool.begin().await?;

        let mut credited = false;
        let mut stored_ref = None;
        if let Some(account_id) = user_ref {
            // Single-statement increment so concurrent credits never lose updates.
            let result = sqlx::query(
                "UPDATE accounts SET balance = balance + ?, last_activity = ? WHERE id = ?",
            )
            .bind(credit)
            .bind(parsed_at.timestamp())
            .bind(account_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                credited = true;
                stored_ref = Some(account_id);
            }
        }

        let result = sqlx::query(
            "INSERT INTO reward_transactions
                 (user_ref, source_name, original_amount, converted_amount, currency_type, parsed_at, raw_text)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored_ref)
        .bind(source_name)
        .bind(original_amount.to_string())
        .bind(converted_amount.to_string())
        .bind(currency_type)
        .bind(parsed_at.timestamp())
        .bind(raw_text)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((result.last_insert_rowid(), credited))
    }

    pub async fn get_transaction(
        &self,
        id: i64,
    ) -> Result<Option<ParsedTransaction>, StorageError> {
        let row = sqlx::query(
            "SELECT id, user_ref, source_name, original_amount, converted_amount,
                    currency_type, parsed_at, raw_text
             FROM reward_transactions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    /// Number of transactions recorded at or after `since`.
    pub async fn recent_transaction_count(
        &self,
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM reward_transactions WHERE parsed_at >= ?",
        )
        .bind(since.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete transactions strictly older than `cutoff`. A transaction parsed
    /// exactly at the cutoff is kept.
    pub async fn prune_transactions_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM reward_transactions WHERE parsed_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- accounts -----------------------------------------------------------

    /// Create the account if missing, otherwise refresh its display name.
    /// An existing balance is never touched here.
    pub async fn upsert_account(
        &self,
        id: i64,
        display_name: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO accounts (id, display_name, balance, last_activity, created_at)
             VALUES (?, ?, 0, ?, ?)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
        )
        .bind(id)
        .bind(display_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(
            "SELECT id, display_name, balance, last_activity, created_at
             FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    /// Manual balance adjustment for operator corrections and seeding.
    /// Returns false when the account does not exist.
    pub async fn adjust_balance(&self, account_id: i64, delta: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE accounts SET balance = balance + ?, last_activity = ? WHERE id = ?",
        )
        .bind(delta)
        .bind(Utc::now().timestamp())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- grants and flags ---------------------------------------------------

    pub async fn insert_grant(
        &self,
        account_id: i64,
        kind: &str,
        granted_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let result = sqlx::query(
            "INSERT INTO grants (account_id, kind, granted_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(kind)
        .bind(granted_at.timestamp())
        .bind(expires_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Grants that are still live at `now`, ordered by expiry.
    pub async fn list_active_grants(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, account_id, kind, granted_at, expires_at
             FROM grants WHERE expires_at > ? ORDER BY expires_at ASC",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(grant_from_row).collect()
    }

    /// Remove every grant whose expiry is at or before `now`. Returns the
    /// number of grants removed.
    pub async fn expire_due_grants(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM grants WHERE expires_at <= ?")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Set (or refresh) a time-limited flag on an account.
    pub async fn set_account_flag(
        &self,
        account_id: i64,
        flag: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO account_flags (account_id, flag, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(account_id, flag) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(account_id)
        .bind(flag)
        .bind(expires_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove every account flag whose expiry is at or before `now`.
    pub async fn expire_account_flags(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM account_flags WHERE expires_at <= ?")
            .bind(now.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ---- row decoding -----------------------------------------------------------

fn rule_from_row(row: &SqliteRow) -> Result<ParsingRule, StorageError> {
    let multiplier_raw: String = row.get("multiplier");
    Ok(ParsingRule {
        id: row.get("id"),
        source_name: row.get("source_name"),
        pattern: row.get("pattern"),
        multiplier: decode_decimal("multiplier", &multiplier_raw)?,
        currency_type: row.get("currency_type"),
        active: row.get("active"),
        compiled: None,
    })
}

fn transaction_from_row(row: &SqliteRow) -> Result<ParsedTransaction, StorageError> {
    let original_raw: String = row.get("original_amount");
    let converted_raw: String = row.get("converted_amount");
    Ok(ParsedTransaction {
        id: row.get("id"),
        user_ref: row.get("user_ref"),
        source_name: row.get("source_name"),
        original_amount: decode_decimal("original_amount", &original_raw)?,
        converted_amount: decode_decimal("converted_amount", &converted_raw)?,
        currency_type: row.get("currency_type"),
        parsed_at: decode_timestamp("parsed_at", row.get("parsed_at"))?,
        raw_text: row.get("raw_text"),
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account, StorageError> {
    Ok(Account {
        id: row.get("id"),
        display_name: row.get("display_name"),
        balance: row.get("balance"),
        last_activity: decode_timestamp("last_activity", row.get("last_activity"))?,
        created_at: decode_timestamp("created_at", row.get("created_at"))?,
    })
}

fn grant_from_row(row: &SqliteRow) -> Result<Grant, StorageError> {
    Ok(Grant {
        id: row.get("id"),
        account_id: row.get("account_id"),
        kind: row.get("kind"),
        granted_at: decode_timestamp("granted_at", row.get("granted_at"))?,
        expires_at: decode_timestamp("expires_at", row.get("expires_at"))?,
    })
}

fn decode_decimal(column: &str, raw: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(raw)
        .map_err(|e| StorageError::Corrupt(format!("{column} '{raw}': {e}")))
}

fn decode_timestamp(column: &str, secs: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Corrupt(format!("{column} {secs} out of range")))
}
