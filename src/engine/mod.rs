// src/engine/mod.rs - rule-driven reward parsing, conversion and persistence

pub mod source_id;

pub use source_id::{DefaultSourceMatcher, SourceMatcher};

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use rust_decimal::Decimal;

use crate::config::ConfigurationManager;
use crate::storage::RewardStore;
use crate::types::{EngineError, ParseOutcome, ParsedTransaction, RewardEvent};

/// Parses raw reward text against the active rule set, converts the captured
/// amount and persists the result. Each call reads a fresh configuration
/// snapshot, so rule changes apply to the next event without restarts.
pub struct RewardEngine {
    store: Arc<RewardStore>,
    config: Arc<ConfigurationManager>,
    matcher: Box<dyn SourceMatcher>,
}

impl RewardEngine {
    pub fn new(store: Arc<RewardStore>, config: Arc<ConfigurationManager>) -> Self {
        Self {
            store,
            config,
            matcher: Box::new(DefaultSourceMatcher::new()),
        }
    }

    /// Swap in a custom source matcher for unhinted events.
    pub fn with_matcher(mut self, matcher: Box<dyn SourceMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Match `event` against the active rules in ascending id order and stop
    /// at the first rule that both fits the source and captures a numeric
    /// amount. A match is converted and persisted before it is returned, so a
    /// `Match` outcome always refers to a stored transaction. No rule
    /// matching is a normal `NoMatch`, not an error.
    ///
    /// A source hint on the event is authoritative: rules for other sources
    /// are skipped without consulting the heuristic matcher.
    pub async fn parse(&self, event: &RewardEvent) -> Result<ParseOutcome, EngineError> {
        let snapshot = self.config.get_configuration().await;

        for rule in snapshot.active_rules() {
            let source_matches = match &event.source_hint {
                Some(hint) => hint.eq_ignore_ascii_case(&rule.source_name),
                None => self
                    .matcher
                    .looks_like_source(&event.raw_text, &rule.source_name),
            };
            if !source_matches {
                continue;
            }

            let Some(raw_amount) = rule.extract_amount(&event.raw_text) else {
                continue;
            };

            let original = match Decimal::from_str(raw_amount) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "rule {} captured non-numeric amount '{raw_amount}': {e}",
                        rule.id
                    );
                    continue;
                }
            };

            // Untrusted text can push the product outside the decimal range.
            let Some(converted) = original.checked_mul(rule.multiplier) else {
                warn!(
                    "rule {} conversion overflowed for amount '{raw_amount}', skipping",
                    rule.id
                );
                continue;
            };
            let parsed_at = Utc::now();
            let max_attempts = snapshot.settings.max_parsing_retries.max(1);
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self
                    .store
                    .record_transaction(
                        event.user_ref,
                        &rule.source_name,
                        original,
                        converted,
                        &rule.currency_type,
                        parsed_at,
                        &event.raw_text,
                    )
                    .await
                {
                    Ok((id, credited)) => {
                        if !credited {
                            if let Some(user_ref) = event.user_ref {
                                warn!(
                                    "no account {user_ref} to credit for transaction {id}, stored unattributed"
                                );
                            }
                        }
                        debug!(
                            "parsed '{}' reward: {original} {} -> {converted} (transaction {id})",
                            rule.source_name, rule.currency_type
                        );
                        return Ok(ParseOutcome::Match(ParsedTransaction {
                            id,
                            user_ref: if credited { event.user_ref } else { None },
                            source_name: rule.source_name.clone(),
                            original_amount: original,
                            converted_amount: converted,
                            currency_type: rule.currency_type.clone(),
                            parsed_at,
                            raw_text: event.raw_text.clone(),
                        }));
                    }
                    Err(e) if attempt < max_attempts => {
                        warn!(
                            "persisting '{}' transaction failed (attempt {attempt}/{max_attempts}): {e}",
                            rule.source_name
                        );
                    }
                    Err(e) => {
                        return Err(EngineError::Persistence {
                            source_name: rule.source_name.clone(),
                            cause: e,
                        });
                    }
                }
            }
        }

        Ok(ParseOutcome::NoMatch)
    }

    /// Convert an amount with the multiplier of the first active rule for
    /// `source_name`. Amounts for unknown sources pass through unchanged;
    /// a product outside the decimal range is an `Overflow` error.
    pub async fn apply_conversion(
        &self,
        amount: Decimal,
        source_name: &str,
    ) -> Result<Decimal, EngineError> {
        let snapshot = self.config.get_configuration().await;
        match snapshot.first_active_rule_for(source_name) {
            Some(rule) => {
                amount
                    .checked_mul(rule.multiplier)
                    .ok_or_else(|| EngineError::Overflow {
                        source_name: rule.source_name.clone(),
                        amount,
                        multiplier: rule.multiplier,
                    })
            }
            None => Ok(amount),
        }
    }

    /// Force a configuration reload on behalf of an operator.
    pub async fn reload_rules(&self) -> (bool, Vec<String>) {
        self.config.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<RewardStore>, Arc<ConfigurationManager>, RewardEngine) {
        let store = Arc::new(
            RewardStore::connect(dir.path().join("engine.db"))
                .await
                .unwrap(),
        );
        store.migrate().await.unwrap();
        let config = Arc::new(ConfigurationManager::new(
            Arc::clone(&store),
            dir.path().join("config"),
        ));
        config.initialize().await.unwrap();
        let engine = RewardEngine::new(Arc::clone(&store), Arc::clone(&config));
        (store, config, engine)
    }

    #[test_log::test(tokio::test)]
    async fn fisher_reward_is_parsed_converted_and_credited() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, engine) = setup(&dir).await;

        store.upsert_account(42, "angler").await.unwrap();
        assert!(store.adjust_balance(42, 100).await.unwrap());

        let event = RewardEvent::new("Fisher caught a fish! Coins: +20").with_user_ref(42);
        let outcome = engine.parse(&event).await.unwrap();
        let tx = outcome.into_transaction().unwrap();

        assert_eq!(tx.source_name, "Fisher");
        assert_eq!(tx.original_amount, Decimal::from(20));
        assert_eq!(tx.converted_amount, Decimal::from(30));
        assert_eq!(tx.currency_type, "coins");
        assert_eq!(tx.user_ref, Some(42));

        let stored = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.converted_amount, tx.converted_amount);
        assert_eq!(stored.raw_text, "Fisher caught a fish! Coins: +20");

        let account = store.get_account(42).await.unwrap().unwrap();
        assert_eq!(account.balance, 130);
    }

    #[tokio::test]
    async fn lowest_id_rule_wins_and_persists_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, engine) = setup(&dir).await;

        // A second Fisher rule with a looser pattern and a larger multiplier.
        config
            .add_rule("Fisher", r"\+(\d+)", Decimal::from(10), "coins")
            .await
            .unwrap();

        let event = RewardEvent::new("Fisher caught a fish! Coins: +20").with_source_hint("Fisher");
        let tx = engine
            .parse(&event)
            .await
            .unwrap()
            .into_transaction()
            .unwrap();

        // The seeded rule has the lower id, so its multiplier applies.
        assert_eq!(tx.converted_amount, Decimal::from(30));
        assert_eq!(
            store
                .recent_transaction_count(chrono::DateTime::UNIX_EPOCH)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn unmatched_text_is_a_clean_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, engine) = setup(&dir).await;

        let event = RewardEvent::new("hello everyone, great stream");
        assert!(!engine.parse(&event).await.unwrap().is_match());
        // Parsing the same event again changes nothing either.
        assert!(!engine.parse(&event).await.unwrap().is_match());

        assert_eq!(
            store
                .recent_transaction_count(chrono::DateTime::UNIX_EPOCH)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn non_numeric_capture_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, engine) = setup(&dir).await;

        config
            .add_rule("Oracle", r"Omen:\s*(\w+)", Decimal::ONE, "omens")
            .await
            .unwrap();

        let event = RewardEvent::new("Oracle says Omen: doom").with_source_hint("Oracle");
        assert!(!engine.parse(&event).await.unwrap().is_match());
        assert_eq!(
            store
                .recent_transaction_count(chrono::DateTime::UNIX_EPOCH)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn overflow_amount_is_a_clean_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, engine) = setup(&dir).await;

        // 6e28 parses as a Decimal, but the Fisher x1.5 product does not fit.
        let event = RewardEvent::new("Fisher Coins: +60000000000000000000000000000")
            .with_source_hint("Fisher");
        assert!(!engine.parse(&event).await.unwrap().is_match());
        assert_eq!(
            store
                .recent_transaction_count(chrono::DateTime::UNIX_EPOCH)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn source_hint_is_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _config, engine) = setup(&dir).await;

        // Fisher-looking text with a Cards hint matches nothing: the Fisher
        // rule is skipped on the hint, the Cards pattern does not fit.
        let mismatch =
            RewardEvent::new("Fisher caught a fish! Coins: +20").with_source_hint("Cards");
        assert!(!engine.parse(&mismatch).await.unwrap().is_match());

        // A hint also matches without any source mention in the text.
        let hinted = RewardEvent::new("Coins: +20").with_source_hint("Fisher");
        let tx = engine
            .parse(&hinted)
            .await
            .unwrap()
            .into_transaction()
            .unwrap();
        assert_eq!(tx.source_name, "Fisher");

        // Without hint or mention, the heuristic finds no source.
        let bare = RewardEvent::new("Coins: +20");
        assert!(!engine.parse(&bare).await.unwrap().is_match());
    }

    #[tokio::test]
    async fn unknown_user_ref_is_stored_unattributed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, engine) = setup(&dir).await;

        let event = RewardEvent::new("Fisher caught a fish! Coins: +20").with_user_ref(9999);
        let tx = engine
            .parse(&event)
            .await
            .unwrap()
            .into_transaction()
            .unwrap();

        assert_eq!(tx.user_ref, None);
        let stored = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.user_ref, None);
    }

    #[tokio::test]
    async fn apply_conversion_uses_rule_multiplier() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _config, engine) = setup(&dir).await;

        assert_eq!(
            engine
                .apply_conversion(Decimal::from(20), "Fisher")
                .await
                .unwrap(),
            Decimal::from(30)
        );
        assert_eq!(
            engine
                .apply_conversion(Decimal::from(20), "fisher")
                .await
                .unwrap(),
            Decimal::from(30)
        );
        assert_eq!(
            engine
                .apply_conversion(Decimal::from(20), "Unknown")
                .await
                .unwrap(),
            Decimal::from(20)
        );
    }

    #[tokio::test]
    async fn apply_conversion_surfaces_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _config, engine) = setup(&dir).await;

        let amount = Decimal::from_str("60000000000000000000000000000").unwrap();
        let err = engine.apply_conversion(amount, "Fisher").await.unwrap_err();
        assert!(matches!(err, EngineError::Overflow { .. }));
        // Unknown sources still pass through untouched at that scale.
        assert_eq!(
            engine.apply_conversion(amount, "Unknown").await.unwrap(),
            amount
        );
    }

    #[tokio::test]
    async fn concurrent_parses_never_lose_credits() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, _engine) = setup(&dir).await;
        store.upsert_account(42, "angler").await.unwrap();

        let engine = Arc::new(RewardEngine::new(Arc::clone(&store), Arc::clone(&config)));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let event = RewardEvent::new("Fisher haul! Coins: +10")
                        .with_source_hint("Fisher")
                        .with_user_ref(42);
                    assert!(engine.parse(&event).await.unwrap().is_match());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 20 events at +10 coins, converted x1.5 and credited as 15 each.
        let account = store.get_account(42).await.unwrap().unwrap();
        assert_eq!(account.balance, 300);
    }

    #[tokio::test]
    async fn persistence_failure_surfaces_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _config, engine) = setup(&dir).await;

        store.close().await;
        let event = RewardEvent::new("Fisher caught a fish! Coins: +20").with_source_hint("Fisher");
        let err = engine.parse(&event).await.unwrap_err();
        match err {
            EngineError::Persistence { source_name, .. } => assert_eq!(source_name, "Fisher"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
