//! Bus consumer pool
//!
//! A fixed pool of workers, each owning its own `StreamConsumer` in the same
//! consumer group; the group protocol splits partitions across them. Every
//! worker is strictly sequential - receive, process to a terminal outcome,
//! route failures to the ledger, commit - so at most one record per worker
//! is in flight and commits never overtake an unfinished earlier record in
//! the same partition.
//!
//! Commits are manual and unconditional on terminal outcome: failed records
//! are acknowledged too, because redelivery is the ledger's job (operator
//! re-injection), not the bus's.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::ledger::FailureLedger;
use crate::models::OrderIntent;
use crate::pipeline::{OrderPipeline, Outcome};

/// Build one consumer with the worker's fixed bus settings: manual commits,
/// 30 s session timeout, 10 s heartbeats, 5 min poll interval.
pub fn build_consumer(config: &AppConfig) -> Result<StreamConsumer, KafkaError> {
    ClientConfig::new()
        .set("group.id", &config.consumer_group)
        .set("bootstrap.servers", &config.bus_bootstrap_servers)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "30000")
        .set("heartbeat.interval.ms", "10000")
        .set("max.poll.interval.ms", "300000")
        .create()
}

/// Where a terminal outcome goes before the ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRoute {
    /// Success or idempotent skip; nothing to record.
    None,
    /// Transient failure; the ledger advances the retry counter.
    Retryable(String),
    /// Permanent failure; straight to the dead-letter namespace.
    DeadLetter(String),
}

/// Classify a pipeline outcome for ledger routing.
pub fn failure_route(outcome: &Outcome) -> FailureRoute {
    match outcome {
        Outcome::Persisted
        | Outcome::SkippedExisting
        | Outcome::SkippedLocked
        | Outcome::StoreConflict => FailureRoute::None,
        Outcome::EnrichmentFailed(reason) => FailureRoute::Retryable(reason.clone()),
        Outcome::EnrichmentDenied(reason) => FailureRoute::DeadLetter(reason.clone()),
        Outcome::DroppedValidation(reason) => {
            FailureRoute::DeadLetter(format!("validation rejected: {reason}"))
        }
    }
}

/// Ledger key for a record: the bus key when present, else the orderId,
/// else a partition/offset synthetic for unparseable keyless records.
pub fn ledger_key(
    bus_key: Option<&[u8]>,
    order_id: Option<&str>,
    partition: i32,
    offset: i64,
) -> String {
    if let Some(key) = bus_key
        && !key.is_empty()
        && let Ok(key) = std::str::from_utf8(key)
    {
        return key.to_string();
    }
    match order_id {
        Some(id) => id.to_string(),
        None => format!("unparsed:{partition}:{offset}"),
    }
}

/// One sequential consumer worker.
pub struct ConsumerWorker {
    id: usize,
    topic: String,
    consumer: StreamConsumer,
    pipeline: Arc<OrderPipeline>,
    ledger: Arc<dyn FailureLedger>,
}

impl ConsumerWorker {
    pub fn new(
        id: usize,
        topic: String,
        consumer: StreamConsumer,
        pipeline: Arc<OrderPipeline>,
        ledger: Arc<dyn FailureLedger>,
    ) -> Self {
        Self {
            id,
            topic,
            consumer,
            pipeline,
            ledger,
        }
    }

    /// Consume until shutdown. The in-flight record always finishes before
    /// the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.consumer.subscribe(&[self.topic.as_str()]) {
            error!("[worker {}] failed to subscribe to {}: {}", self.id, self.topic, e);
            return;
        }
        info!("[worker {}] consuming {}", self.id, self.topic);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.consumer.recv() => match received {
                    Ok(message) => self.handle(&message).await,
                    Err(e) => {
                        error!("[worker {}] poll error: {}", self.id, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        info!("[worker {}] shut down", self.id);
    }

    async fn handle(&self, message: &BorrowedMessage<'_>) {
        let payload = message.payload().unwrap_or_default();
        let payload_str = String::from_utf8_lossy(payload).into_owned();

        match OrderIntent::parse(payload) {
            Ok(intent) => {
                let key = ledger_key(
                    message.key(),
                    Some(&intent.order_id),
                    message.partition(),
                    message.offset(),
                );
                let outcome = self.pipeline.process(&intent).await;
                self.route(&key, &payload_str, &outcome).await;
            }
            Err(e) => {
                let key = ledger_key(message.key(), None, message.partition(), message.offset());
                warn!("[worker {}] unparseable record {}: {}", self.id, key, e);
                if let Err(le) = self
                    .ledger
                    .record_dead_letter(&key, &payload_str, &e.to_string())
                    .await
                {
                    error!("[worker {}] ledger write failed for {}: {}", self.id, key, le);
                }
            }
        }

        // Ack unconditionally on terminal outcome so the bus never redelivers.
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            error!("[worker {}] commit failed: {}", self.id, e);
        }
    }

    async fn route(&self, key: &str, payload: &str, outcome: &Outcome) {
        let result = match failure_route(outcome) {
            FailureRoute::None => return,
            FailureRoute::Retryable(reason) => {
                self.ledger.record(key, payload, &reason).await.map(|_| ())
            }
            FailureRoute::DeadLetter(reason) => {
                self.ledger.record_dead_letter(key, payload, &reason).await
            }
        };
        if let Err(e) = result {
            // Still ack: losing one ledger entry beats a redelivery storm.
            error!("[worker {}] ledger write failed for {}: {}", self.id, key, e);
        }
    }
}

/// Spawn the configured number of workers, each with its own consumer.
pub fn spawn_workers(
    config: &AppConfig,
    pipeline: Arc<OrderPipeline>,
    ledger: Arc<dyn FailureLedger>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>, KafkaError> {
    let mut handles = Vec::with_capacity(config.consumer_concurrency);
    for id in 0..config.consumer_concurrency {
        let worker = ConsumerWorker::new(
            id,
            config.topic.clone(),
            build_consumer(config)?,
            Arc::clone(&pipeline),
            Arc::clone(&ledger),
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    Ok(handles)
}
