//! Ingestion poller: fetches recent mail, skips anything already ingested,
//! and starts one engine run per new message.
//!
//! A message id is recorded in the dedup store only after `Engine::start`
//! returned `Ok`, so a crash between the two re-ingests it on the next poll.
//! Every poller sharing a store takes a store-held claim on an id before
//! checking the dedup record; whoever holds the claim also records, so a
//! second poller, in this process or another, either sees the claim or sees
//! the record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::MailboxSource;
use crate::config::PollerConfig;
use crate::error::Error;
use crate::store::DedupStore;
use crate::workflow::Engine;
use crate::workflow::state::Message;

pub struct IngestionPoller {
    mailbox: Arc<dyn MailboxSource>,
    dedup: Arc<dyn DedupStore>,
    engine: Arc<Engine>,
    config: PollerConfig,
}

/// What happened to one fetched message.
#[derive(Debug, PartialEq, Eq)]
enum Ingest {
    Started,
    Skipped,
}

impl IngestionPoller {
    pub fn new(
        mailbox: Arc<dyn MailboxSource>,
        dedup: Arc<dyn DedupStore>,
        engine: Arc<Engine>,
        config: PollerConfig,
    ) -> Self {
        Self {
            mailbox,
            dedup,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Run one poll cycle. Returns the number of runs started.
    ///
    /// A fetch failure or an unavailable dedup store aborts the cycle. A
    /// failure starting one message is logged and the batch continues.
    pub async fn poll(&self) -> Result<usize, Error> {
        let messages = self.mailbox.fetch_recent(self.config.batch_limit).await?;
        if messages.is_empty() {
            return Ok(0);
        }
        debug!(
            mailbox = self.mailbox.name(),
            count = messages.len(),
            "Fetched messages"
        );

        let mut started = 0;
        for message in messages {
            let message_id = message.id.clone();
            if !self
                .dedup
                .claim(&message_id, self.config.claim_lease)
                .await?
            {
                debug!(message_id = %message_id, "Message claimed by another poller");
                continue;
            }
            let outcome = self.ingest(message).await;
            if let Err(e) = self.dedup.release(&message_id).await {
                warn!(message_id = %message_id, error = %e, "Failed to release ingestion claim");
            }

            if outcome? == Ingest::Started {
                started += 1;
            }
        }

        if started > 0 {
            info!(started, "Poll cycle started new runs");
        }
        Ok(started)
    }

    /// Handle one claimed message.
    async fn ingest(&self, message: Message) -> Result<Ingest, Error> {
        let message_id = message.id.clone();
        if self.dedup.is_ingested(&message_id).await? {
            return Ok(Ingest::Skipped);
        }

        if self.is_own_message(&message.sender) {
            debug!(message_id = %message_id, sender = %message.sender, "Skipping self-sent message");
            self.dedup.record_ingested(&message_id).await?;
            return Ok(Ingest::Skipped);
        }

        if !is_sender_allowed(&self.config.allowed_senders, &message.sender) {
            warn!(message_id = %message_id, sender = %message.sender, "Blocked message from sender");
            self.dedup.record_ingested(&message_id).await?;
            return Ok(Ingest::Skipped);
        }

        match self.engine.start(message).await {
            Ok(run_id) => {
                if !self.dedup.record_ingested(&message_id).await? {
                    warn!(message_id = %message_id, run_id = %run_id, "Message was recorded concurrently");
                }
                debug!(message_id = %message_id, run_id = %run_id, "Message ingested");
                Ok(Ingest::Started)
            }
            Err(Error::Validation(e)) => {
                warn!(message_id = %message_id, error = %e, "Rejected invalid message");
                self.dedup.record_ingested(&message_id).await?;
                Ok(Ingest::Skipped)
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to start run, will retry next poll");
                Ok(Ingest::Skipped)
            }
        }
    }

    fn is_own_message(&self, sender: &str) -> bool {
        self.config
            .own_address
            .as_deref()
            .is_some_and(|own| own.eq_ignore_ascii_case(sender))
    }
}

/// Check if a sender is on the allowlist. An empty list allows everyone.
/// Entries are full addresses or `@domain` suffixes.
pub fn is_sender_allowed(allowed: &[String], sender: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let sender = sender.to_lowercase();
    allowed.iter().any(|a| {
        let a = a.to_lowercase();
        if a.starts_with('@') {
            sender.ends_with(&a)
        } else {
            sender == a
        }
    })
}

/// Spawn a background task that calls `poll()` every `config.interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_ingestion_poller(poller: Arc<IngestionPoller>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let interval = poller.config.interval;
        info!(
            mailbox = poller.mailbox.name(),
            "Ingestion poller started, polling every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Ingestion poller shutting down");
                return;
            }

            if let Err(e) = poller.poll().await {
                error!(error = %e, "Poll cycle failed");
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{ChannelError, LlmError};
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
    use crate::store::InMemoryStore;
    use crate::workflow::EngineDeps;

    /// Same answer for every step: parses as context, classification and draft.
    struct EchoLlm;

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: r#"{"summary": "ok", "intent": "simple_direct"}"#.into(),
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    struct FixedMailbox {
        messages: Vec<Message>,
        fetches: AtomicUsize,
        fail_fetch: bool,
    }

    impl FixedMailbox {
        fn new(messages: Vec<Message>) -> Self {
            Self {
                messages,
                fetches: AtomicUsize::new(0),
                fail_fetch: false,
            }
        }
    }

    #[async_trait]
    impl MailboxSource for FixedMailbox {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch_recent(&self, limit: usize) -> Result<Vec<Message>, ChannelError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                return Err(ChannelError::FetchFailed {
                    name: "fixed".into(),
                    reason: "offline".into(),
                });
            }
            let start = self.messages.len().saturating_sub(limit);
            Ok(self.messages[start..].to_vec())
        }

        async fn send(&self, _message: &Message, _draft: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn poller_with(
        mailbox: Arc<FixedMailbox>,
        store: Arc<InMemoryStore>,
        config: PollerConfig,
    ) -> IngestionPoller {
        split_poller(mailbox, store.clone(), store, config)
    }

    /// Poller whose dedup records live apart from the engine's store.
    fn split_poller(
        mailbox: Arc<FixedMailbox>,
        dedup: Arc<InMemoryStore>,
        runs: Arc<InMemoryStore>,
        config: PollerConfig,
    ) -> IngestionPoller {
        let engine = Engine::new(
            EngineDeps {
                llm: Arc::new(EchoLlm),
                mailbox: mailbox.clone(),
                checkpoints: runs.clone(),
                history: runs,
            },
            EngineConfig {
                retry_backoff: Duration::ZERO,
                ..EngineConfig::default()
            },
        );
        IngestionPoller::new(mailbox, dedup, Arc::new(engine), config)
    }

    fn msg(id: &str, sender: &str) -> Message {
        Message::new(id, sender, "Hello", "Thanks")
    }

    #[test]
    fn allowlist_semantics() {
        assert!(is_sender_allowed(&[], "anyone@example.com"));
        let allowed = vec!["alice@example.com".to_string(), "@corp.io".to_string()];
        assert!(is_sender_allowed(&allowed, "Alice@Example.com"));
        assert!(is_sender_allowed(&allowed, "bob@corp.io"));
        assert!(!is_sender_allowed(&allowed, "eve@example.com"));
    }

    #[tokio::test]
    async fn poll_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![
            msg("m1", "alice@example.com"),
            msg("m2", "bob@example.com"),
        ]));
        let poller = poller_with(mailbox, store.clone(), PollerConfig::default());

        assert_eq!(poller.poll().await.unwrap(), 2);
        assert_eq!(poller.poll().await.unwrap(), 0);
        assert_eq!(store.ingested_count().await, 2);
        assert_eq!(poller.engine.list_suspended().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_message_is_recorded_not_started() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![Message::new(
            "blank",
            "alice@example.com",
            "Hello",
            "   ",
        )]));
        let poller = poller_with(mailbox, store.clone(), PollerConfig::default());

        assert_eq!(poller.poll().await.unwrap(), 0);
        assert!(store.is_ingested("blank").await.unwrap());
        assert!(poller.engine.list_suspended().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn own_and_blocked_senders_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![
            msg("self", "me@example.com"),
            msg("stranger", "eve@elsewhere.net"),
            msg("friend", "alice@example.com"),
        ]));
        let config = PollerConfig {
            allowed_senders: vec!["@example.com".into()],
            own_address: Some("Me@Example.com".into()),
            ..PollerConfig::default()
        };
        let poller = poller_with(mailbox, store.clone(), config);

        assert_eq!(poller.poll().await.unwrap(), 1);
        assert_eq!(store.ingested_count().await, 3);
    }

    #[tokio::test]
    async fn start_failure_leaves_message_for_next_poll() {
        let dedup = Arc::new(InMemoryStore::new());
        let runs = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![msg("m1", "alice@example.com")]));
        let poller = split_poller(mailbox, dedup.clone(), runs.clone(), PollerConfig::default());

        runs.set_fail_writes(true);
        assert_eq!(poller.poll().await.unwrap(), 0);
        runs.set_fail_writes(false);
        assert!(!dedup.is_ingested("m1").await.unwrap());

        // The claim was released, so the next poll retries the message.
        assert_eq!(poller.poll().await.unwrap(), 1);
        assert!(dedup.is_ingested("m1").await.unwrap());
    }

    #[tokio::test]
    async fn message_claimed_elsewhere_is_left_alone() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![msg("m1", "alice@example.com")]));
        let poller = poller_with(mailbox, store.clone(), PollerConfig::default());

        assert!(store.claim("m1", Duration::from_secs(60)).await.unwrap());
        assert_eq!(poller.poll().await.unwrap(), 0);
        assert!(!store.is_ingested("m1").await.unwrap());

        store.release("m1").await.unwrap();
        assert_eq!(poller.poll().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_claim_store_aborts_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![msg("m1", "alice@example.com")]));
        let poller = poller_with(mailbox, store.clone(), PollerConfig::default());

        store.set_fail_writes(true);
        assert!(matches!(poller.poll().await, Err(Error::Database(_))));
        store.set_fail_writes(false);
        assert!(poller.engine.list_suspended().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        let mut mailbox = FixedMailbox::new(vec![msg("m1", "alice@example.com")]);
        mailbox.fail_fetch = true;
        let poller = poller_with(Arc::new(mailbox), store, PollerConfig::default());

        assert!(matches!(poller.poll().await, Err(Error::Channel(_))));
    }

    #[tokio::test]
    async fn batch_limit_takes_most_recent() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(vec![
            msg("old", "alice@example.com"),
            msg("new", "alice@example.com"),
        ]));
        let config = PollerConfig {
            batch_limit: 1,
            ..PollerConfig::default()
        };
        let poller = poller_with(mailbox, store.clone(), config);

        assert_eq!(poller.poll().await.unwrap(), 1);
        assert!(store.is_ingested("new").await.unwrap());
        assert!(!store.is_ingested("old").await.unwrap());
    }

    #[tokio::test]
    async fn spawned_poller_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(FixedMailbox::new(Vec::new()));
        let config = PollerConfig {
            interval: Duration::from_millis(10),
            ..PollerConfig::default()
        };
        let poller = Arc::new(poller_with(mailbox.clone(), store, config));

        let (handle, shutdown) = spawn_ingestion_poller(poller);
        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(mailbox.fetches.load(Ordering::SeqCst) >= 1);
    }
}
