// src/types/mod.rs - Core data model for reward parsing and conversion

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One inbound text event as delivered by the transport layer.
///
/// Constructed once at the transport boundary so the parsing engine has a
/// single concrete input shape regardless of where the text came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEvent {
    /// The full raw message text, stored verbatim on any resulting transaction.
    pub raw_text: String,
    /// Explicit sender identity when the transport knows it (e.g. the bot account name).
    pub source_hint: Option<String>,
    /// Resolved internal account id, if identity resolution succeeded upstream.
    pub user_ref: Option<i64>,
}

impl RewardEvent {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            source_hint: None,
            user_ref: None,
        }
    }

    pub fn with_source_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_hint = Some(hint.into());
        self
    }

    pub fn with_user_ref(mut self, user_ref: i64) -> Self {
        self.user_ref = Some(user_ref);
        self
    }
}

/// One source-specific extraction rule: pattern plus conversion multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingRule {
    pub id: i64,
    /// External emitter this rule applies to (e.g. "Fisher").
    pub source_name: String,
    /// Regular expression with at least one capture group; the first group
    /// is the numeric amount.
    pub pattern: String,
    /// Conversion factor, must be > 0.
    pub multiplier: Decimal,
    pub currency_type: String,
    /// Soft-disable flag; inactive rules are skipped in the hot path.
    pub active: bool,
    /// Compiled form of `pattern`, populated when a snapshot is built.
    #[serde(skip)]
    pub compiled: Option<Regex>,
}

impl ParsingRule {
    pub fn new(
        id: i64,
        source_name: impl Into<String>,
        pattern: impl Into<String>,
        multiplier: Decimal,
        currency_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            source_name: source_name.into(),
            pattern: pattern.into(),
            multiplier,
            currency_type: currency_type.into(),
            active: true,
            compiled: None,
        }
    }

    /// Compile the pattern (case-insensitive, multi-line) and cache the result.
    pub fn compile(&mut self) -> Result<(), String> {
        match Self::build_regex(&self.pattern) {
            Ok(regex) => {
                self.compiled = Some(regex);
                Ok(())
            }
            Err(e) => Err(format!(
                "invalid pattern for source '{}': {}",
                self.source_name, e
            )),
        }
    }

    /// Build the case-insensitive, multi-line regex for a rule pattern.
    pub fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
        regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
    }

    /// Run the compiled pattern against `text` and return the first capture
    /// group, or `None` if the pattern has not been compiled or does not match.
    pub fn extract_amount<'t>(&self, text: &'t str) -> Option<&'t str> {
        let regex = self.compiled.as_ref()?;
        regex
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

// Regex has no PartialEq; rules compare by their declarative fields only.
impl PartialEq for ParsingRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.source_name == other.source_name
            && self.pattern == other.pattern
            && self.multiplier == other.multiplier
            && self.currency_type == other.currency_type
            && self.active == other.active
    }
}

/// Field-level changes to apply to an existing rule. `None` = leave unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleChanges {
    pub pattern: Option<String>,
    pub multiplier: Option<Decimal>,
    pub currency_type: Option<String>,
    pub active: Option<bool>,
}

impl RuleChanges {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none()
            && self.multiplier.is_none()
            && self.currency_type.is_none()
            && self.active.is_none()
    }
}

/// Immutable audit record of one successful parse.
///
/// `converted_amount` is baked in at parse time; later rule edits never
/// retroactively change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub id: i64,
    /// Nullable: the emitting source may not map to a known account.
    pub user_ref: Option<i64>,
    pub source_name: String,
    pub original_amount: Decimal,
    pub converted_amount: Decimal,
    pub currency_type: String,
    pub parsed_at: chrono::DateTime<chrono::Utc>,
    /// Full matched message, verbatim, for audit.
    pub raw_text: String,
}

/// Result of one `parse()` call. `NoMatch` is the expected outcome for the
/// majority of inbound text and is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Match(ParsedTransaction),
    NoMatch,
}

impl ParseOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, ParseOutcome::Match(_))
    }

    pub fn into_transaction(self) -> Option<ParsedTransaction> {
        match self {
            ParseOutcome::Match(tx) => Some(tx),
            ParseOutcome::NoMatch => None,
        }
    }
}

/// A user account as the store sees it: an integer balance plus activity times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub display_name: String,
    pub balance: i64,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A time-limited permission on an account, subject to expiry-driven cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub account_id: i64,
    /// What the grant confers (free-form tag, e.g. "vip").
    pub kind: String,
    pub granted_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Point-in-time health report, produced fresh on each monitoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub storage_connected: bool,
    pub parsing_active: bool,
    pub background_tasks_running: bool,
    pub checked_at: chrono::DateTime<chrono::Utc>,
    pub errors: Vec<String>,
}

impl HealthStatus {
    /// Report with every check failed, used when even the checks themselves
    /// could not run.
    pub fn unhealthy(errors: Vec<String>) -> Self {
        Self {
            healthy: false,
            storage_connected: false,
            parsing_active: false,
            background_tasks_running: false,
            checked_at: chrono::Utc::now(),
            errors,
        }
    }
}

/// Outcome of one cleanup pass. Logged, never persisted.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub cleaned_grants: u64,
    pub cleaned_records: u64,
    pub errors: Vec<String>,
    pub summary: String,
}

impl CleanupResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fill in the human-readable summary from the counters collected so far.
    pub fn finalize(&mut self) {
        self.summary = if self.errors.is_empty() {
            format!(
                "cleanup ok: {} grants expired, {} records pruned",
                self.cleaned_grants, self.cleaned_records
            )
        } else {
            format!(
                "cleanup finished with {} error(s): {} grants expired, {} records pruned",
                self.errors.len(),
                self.cleaned_grants,
                self.cleaned_records
            )
        };
    }
}

/// Pure read of the scheduler's current state, safe to call at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub cleanup_interval_seconds: u64,
    pub monitoring_interval_seconds: u64,
    pub cleanup_job_alive: bool,
    pub monitoring_job_alive: bool,
    pub last_status_check: chrono::DateTime<chrono::Utc>,
}

/// Errors surfaced by the rule and transaction store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing database could not be reached or the query failed.
    /// Callers must not assume partial writes succeeded.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// A value could not be decoded or represented (e.g. a malformed decimal,
    /// or an amount outside the integer credit range).
    #[error("stored value malformed: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the parsing engine. A failed match is not an error;
/// only persistence failures and unrepresentable conversions cross this
/// boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to persist transaction for source '{source_name}': {cause}")]
    Persistence {
        source_name: String,
        #[source]
        cause: StorageError,
    },

    /// The converted amount exceeds the representable decimal range.
    #[error("conversion overflow for source '{source_name}': {amount} x {multiplier}")]
    Overflow {
        source_name: String,
        amount: Decimal,
        multiplier: Decimal,
    },
}
