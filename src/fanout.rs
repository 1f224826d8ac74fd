//! Subscriber Fan-out Adapter (spec.md §4.8). The subscriber registry and
//! message templating live in the external chat-bot; the core only reads
//! the registry (filtering by `tier_filter`) and removes permanently
//! unreachable recipients, per spec.md §3/§4.8.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};

use crate::metrics::Metrics;
use crate::model::AlertRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    User,
    Group,
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub subscriber_id: String,
    pub tier_filter: std::collections::HashSet<u8>,
    pub kind: SubscriberKind,
}

/// The external subscriber registry (spec.md §3): `subscriber_id ->
/// {tier_filter, kind}`. Join/leave is owned by the chat-bot UI; the core
/// only reads it for delivery and removes permanently unreachable entries.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, subscriber: Subscriber) {
        self.subscribers
            .write()
            .await
            .insert(subscriber.subscriber_id.clone(), subscriber);
    }

    pub async fn remove(&self, subscriber_id: &str) {
        self.subscribers.write().await.remove(subscriber_id);
    }

    pub async fn for_tier(&self, tier: u8) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|s| s.tier_filter.contains(&tier))
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

/// Outcome of one delivery attempt, used to decide whether a recipient is
/// evicted from the registry (spec.md §4.8: only the permanent-unreachable
/// class is evicted; transient timeouts are retried in place).
pub enum DeliveryError {
    Transient(String),
    Unreachable(String),
}

/// Delivers one record to one subscriber. The actual outgoing message
/// formatting is owned by the external chat-bot (spec.md §1 Out of scope);
/// this trait only carries the data fields the alert must ship with.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, subscriber: &Subscriber, record: &AlertRecord) -> Result<(), DeliveryError>;
}

/// Default delivery: always succeeds. Stands in until a concrete chat-bot
/// transport is wired in (SPEC_FULL.md [SUPPLEMENT], mirroring the
/// `QuoteService`/`OutcomesFeed` injectable-capability pattern).
pub struct NoopDelivery;

#[async_trait]
impl Delivery for NoopDelivery {
    async fn send(&self, _subscriber: &Subscriber, _record: &AlertRecord) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Posts Tier-1 records to a configured broadcast channel, independent of
/// the per-subscriber registry (spec.md §4.8).
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn post(&self, record: &AlertRecord) -> Result<(), String>;
}

/// Non-blocking fan-out: `deliver` only enqueues onto an internal bounded
/// channel (spec.md §5's Correlator->Fan-out channel, capacity 256);
/// a background task does the actual per-recipient retries so the emitter
/// never blocks on delivery.
pub struct FanOut {
    tx: mpsc::Sender<AlertRecord>,
    dropped: Arc<AtomicU64>,
    metrics: Option<Arc<Metrics>>,
}

impl FanOut {
    /// Convenience constructor: no-op delivery, default channel capacity.
    pub fn new(registry: Arc<SubscriberRegistry>, broadcast: Option<Arc<dyn BroadcastChannel>>) -> Self {
        Self::with_delivery(registry, broadcast, Arc::new(NoopDelivery), 256, None)
    }

    pub fn with_delivery(
        registry: Arc<SubscriberRegistry>,
        broadcast: Option<Arc<dyn BroadcastChannel>>,
        delivery: Arc<dyn Delivery>,
        capacity: usize,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<AlertRecord>(capacity);
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let recipients = registry.for_tier(record.tier).await;
                for subscriber in recipients {
                    match deliver_with_retry(delivery.as_ref(), &subscriber, &record).await {
                        Ok(()) => {}
                        Err(DeliveryError::Unreachable(reason)) => {
                            tracing::warn!(
                                subscriber_id = %subscriber.subscriber_id,
                                reason,
                                "evicting permanently unreachable subscriber"
                            );
                            registry.remove(&subscriber.subscriber_id).await;
                        }
                        Err(DeliveryError::Transient(reason)) => {
                            tracing::warn!(
                                subscriber_id = %subscriber.subscriber_id,
                                reason,
                                "fan-out delivery failed after retries, leaving subscriber registered"
                            );
                        }
                    }
                }

                if record.tier == 1 {
                    if let Some(channel) = &broadcast {
                        if let Err(e) = channel.post(&record).await {
                            tracing::warn!(error = %e, "tier-1 broadcast post failed");
                        }
                    }
                }
            }
        });

        Self { tx, dropped, metrics }
    }

    /// Non-blocking per spec.md §5: on overflow, drops with a warning and
    /// increments the dropped-delivery counter; the durable log is
    /// unaffected (this runs strictly after `DurableLog::append`).
    pub async fn deliver(&self, record: AlertRecord) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_fanout_dropped();
            }
            tracing::warn!("fan-out channel full, dropping delivery");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn deliver_with_retry(
    delivery: &dyn Delivery,
    subscriber: &Subscriber,
    record: &AlertRecord,
) -> Result<(), DeliveryError> {
    let mut last_err = None;
    for attempt in 0..=2 {
        match delivery.send(subscriber, record).await {
            Ok(()) => return Ok(()),
            Err(DeliveryError::Unreachable(reason)) => return Err(DeliveryError::Unreachable(reason)),
            Err(DeliveryError::Transient(reason)) => {
                last_err = Some(reason);
                if attempt < 2 {
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    Err(DeliveryError::Transient(last_err.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    fn record(tier: u8) -> AlertRecord {
        AlertRecord {
            id: "AAAAAAAA_2026-01-02".into(),
            token: "FOO".into(),
            tier,
            level: if tier == 1 { "HIGH".into() } else { "MEDIUM".into() },
            timestamp: Utc::now(),
            contract: "AAAA".into(),
            entry_mc_usd: None,
            hotlist: "No".into(),
            description: String::new(),
            matched_signals: vec![],
            tags: vec![],
            liquidity: None,
            callers: None,
            subs: None,
            confirmation_count: 0,
            cohort_time: String::new(),
        }
    }

    struct CountingDelivery {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Delivery for CountingDelivery {
        async fn send(&self, _subscriber: &Subscriber, _record: &AlertRecord) -> Result<(), DeliveryError> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct AlwaysUnreachable;

    #[async_trait]
    impl Delivery for AlwaysUnreachable {
        async fn send(&self, _subscriber: &Subscriber, _record: &AlertRecord) -> Result<(), DeliveryError> {
            Err(DeliveryError::Unreachable("gone".into()))
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_tier_filter() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry
            .upsert(Subscriber {
                subscriber_id: "s1".into(),
                tier_filter: [1u8].into_iter().collect(),
                kind: SubscriberKind::User,
            })
            .await;
        registry
            .upsert(Subscriber {
                subscriber_id: "s2".into(),
                tier_filter: [2u8, 3u8].into_iter().collect(),
                kind: SubscriberKind::Group,
            })
            .await;

        let delivery = Arc::new(CountingDelivery {
            count: AtomicUsize::new(0),
        });
        let fanout = FanOut::with_delivery(registry, None, delivery.clone(), 16, None);
        fanout.deliver(record(1)).await;

        timeout(Duration::from_millis(200), async {
            loop {
                if delivery.count.load(Ordering::Relaxed) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(delivery.count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unreachable_subscriber_is_evicted() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry
            .upsert(Subscriber {
                subscriber_id: "gone".into(),
                tier_filter: [1u8, 2, 3].into_iter().collect(),
                kind: SubscriberKind::User,
            })
            .await;
        let registry_check = registry.clone();

        let fanout = FanOut::with_delivery(registry, None, Arc::new(AlwaysUnreachable), 16, None);
        fanout.deliver(record(2)).await;

        timeout(Duration::from_millis(300), async {
            loop {
                if registry_check.count().await == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(registry_check.count().await, 0);
    }

    #[test]
    fn tier_export_sanity() {
        assert_eq!(Tier::One.as_u8(), 1);
    }
}
