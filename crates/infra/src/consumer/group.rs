use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use circstore_core::DomainError;
use circstore_events::{
    BrokerError, ConsumedRecord, ConsumerConnector, Environment, RecordHandler, Subscription,
    SubscriptionRequest, TopicIdentity,
};

use super::load_sensor::{LoadPermit, LoadSensor};
use super::ordering::KeySequencer;
use crate::config::ServiceConfig;

/// Lifecycle of a consumer.
///
/// `Stopped → Starting → Running → Stopping → Stopped`; a failed start goes
/// straight back to `Stopped`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConsumerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl core::fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ConsumerStatus::Stopped => "STOPPED",
            ConsumerStatus::Starting => "STARTING",
            ConsumerStatus::Running => "RUNNING",
            ConsumerStatus::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a consumer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConsumerState {
    pub status: ConsumerStatus,
    pub in_flight: usize,
    pub load_limit: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    #[error("cannot {operation} a consumer that is {status}")]
    InvalidState {
        operation: &'static str,
        status: ConsumerStatus,
    },

    #[error("invalid subscription: {0}")]
    Pattern(#[source] DomainError),

    #[error("subscription failed: {0}")]
    Subscribe(#[source] BrokerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub client_id: String,
    /// Most records this consumer handles at once.
    pub load_limit: usize,
    /// How long one poll waits for records before the loop re-checks for stop.
    pub poll_interval: Duration,
}

impl ConsumerSettings {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Group `{module}.{shortName}.{moduleName}`, client `{moduleName}-{instanceId}`.
    pub fn for_topic(
        topic: TopicIdentity,
        module_name: &str,
        instance_id: &str,
        load_limit: usize,
    ) -> Self {
        Self {
            group_id: format!("{}.{}", topic.logical_name(), module_name),
            client_id: format!("{module_name}-{instance_id}"),
            load_limit: load_limit.max(1),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_config(topic: TopicIdentity, config: &ServiceConfig) -> Self {
        Self::for_topic(
            topic,
            &config.module_name,
            &config.instance_id,
            config.consumer_load_limit,
        )
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// One consumer for one logical topic across every tenant.
///
/// Records are fetched by a single loop and handled on spawned tasks. The
/// number of records in flight never exceeds the consumer's own limit nor the
/// shared sensor's ceiling. Records sharing a key reach the handler in fetch
/// order.
///
/// Offsets are committed after the handler returns, **whether or not it
/// succeeded**: a failing record is logged and skipped rather than retried, so
/// one bad record cannot stall its partition.
///
/// The fetch loop itself moves the consumer from `Stopping` to `Stopped` once
/// it has drained, so a `stop()` abandoned by its caller still completes.
pub struct ConsumerGroup {
    topic: TopicIdentity,
    environment: Environment,
    settings: ConsumerSettings,
    connector: Arc<dyn ConsumerConnector>,
    global: Arc<LoadSensor>,
    local: Arc<LoadSensor>,
    status: Arc<watch::Sender<ConsumerStatus>>,
    /// Stop signal of the running fetch loop.
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl ConsumerGroup {
    pub fn new(
        topic: TopicIdentity,
        environment: Environment,
        settings: ConsumerSettings,
        connector: Arc<dyn ConsumerConnector>,
        global: Arc<LoadSensor>,
    ) -> Self {
        let local = Arc::new(LoadSensor::new(settings.load_limit));
        let (status, _) = watch::channel(ConsumerStatus::Stopped);
        Self {
            topic,
            environment,
            settings,
            connector,
            global,
            local,
            status: Arc::new(status),
            stop: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> TopicIdentity {
        self.topic
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn status(&self) -> ConsumerStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState {
            status: self.status(),
            in_flight: self.local.in_flight(),
            load_limit: self.local.limit(),
        }
    }

    /// Subscribe to every tenant's instance of the topic and start handling.
    #[instrument(
        skip(self, handler),
        fields(topic = %self.topic.logical_name(), group = %self.settings.group_id),
        err
    )]
    pub async fn start(&self, handler: Arc<dyn RecordHandler>) -> Result<(), ConsumerError> {
        self.transition("start", ConsumerStatus::Stopped, ConsumerStatus::Starting)?;

        let pattern = match self.topic.subscription_pattern(&self.environment) {
            Ok(pattern) => pattern,
            Err(e) => {
                self.status.send_replace(ConsumerStatus::Stopped);
                return Err(ConsumerError::Pattern(e));
            }
        };
        let request = SubscriptionRequest {
            pattern,
            group_id: self.settings.group_id.clone(),
            client_id: self.settings.client_id.clone(),
        };
        let pattern = request.pattern.as_str().to_string();

        let subscription = match self.connector.subscribe(request).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.status.send_replace(ConsumerStatus::Stopped);
                return Err(ConsumerError::Subscribe(e));
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let fetch_loop = FetchLoop {
            subscription,
            handler,
            local: self.local.clone(),
            global: self.global.clone(),
            sequencer: KeySequencer::new(),
            poll_interval: self.settings.poll_interval,
            stop: stop_rx,
        };

        *lock(&self.stop) = Some(stop_tx);
        self.status.send_replace(ConsumerStatus::Running);
        let finished = MarkStopped(self.status.clone());
        tokio::spawn(async move {
            let _finished = finished;
            fetch_loop.run().await;
        });

        info!(%pattern, client = %self.settings.client_id, "consumer started");
        Ok(())
    }

    /// Stop fetching, wait for in-flight records, release the subscription.
    ///
    /// Stopping a stopped consumer is a no-op. Calling it again while an
    /// earlier stop is still draining waits for that drain.
    #[instrument(skip(self), fields(topic = %self.topic.logical_name()), err)]
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        let mut observed = ConsumerStatus::Stopped;
        self.status.send_if_modified(|status| {
            observed = *status;
            if *status == ConsumerStatus::Running {
                *status = ConsumerStatus::Stopping;
                return true;
            }
            false
        });

        match observed {
            ConsumerStatus::Stopped => return Ok(()),
            ConsumerStatus::Starting => {
                return Err(ConsumerError::InvalidState {
                    operation: "stop",
                    status: observed,
                });
            }
            ConsumerStatus::Running => {
                if let Some(stop) = lock(&self.stop).take() {
                    let _ = stop.send(true);
                }
            }
            ConsumerStatus::Stopping => {}
        }

        let mut updates = self.status.subscribe();
        if updates
            .wait_for(|status| *status == ConsumerStatus::Stopped)
            .await
            .is_err()
        {
            error!("consumer status channel closed while stopping");
        }
        info!("consumer stopped");
        Ok(())
    }

    fn transition(
        &self,
        operation: &'static str,
        from: ConsumerStatus,
        to: ConsumerStatus,
    ) -> Result<(), ConsumerError> {
        let mut result = Ok(());
        self.status.send_if_modified(|status| {
            if *status != from {
                result = Err(ConsumerError::InvalidState {
                    operation,
                    status: *status,
                });
                return false;
            }
            *status = to;
            true
        });
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks the consumer stopped when the fetch loop task ends, however it ends.
struct MarkStopped(Arc<watch::Sender<ConsumerStatus>>);

impl Drop for MarkStopped {
    fn drop(&mut self) {
        let previous = self.0.send_replace(ConsumerStatus::Stopped);
        if previous == ConsumerStatus::Running {
            warn!("fetch loop ended without a stop request");
        }
    }
}

struct FetchLoop {
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn RecordHandler>,
    local: Arc<LoadSensor>,
    global: Arc<LoadSensor>,
    sequencer: KeySequencer,
    poll_interval: Duration,
    stop: watch::Receiver<bool>,
}

impl FetchLoop {
    async fn run(mut self) {
        while !self.stop_requested() {
            let Some(budget) = self.reserve().await else {
                break;
            };

            let records = match self.subscription.poll(budget, self.poll_interval).await {
                Ok(records) => records,
                Err(BrokerError::Closed) => {
                    self.release(budget);
                    break;
                }
                Err(e) => {
                    self.release(budget);
                    warn!(error = %e, "poll failed; backing off");
                    self.pause(self.poll_interval).await;
                    continue;
                }
            };

            self.release(budget.saturating_sub(records.len()));
            for record in records {
                self.dispatch(record);
            }
        }

        self.drain().await;
        self.subscription.close().await;
    }

    /// Reserve capacity on both sensors before polling. Returns `None` when a
    /// stop arrives while waiting.
    async fn reserve(&mut self) -> Option<usize> {
        loop {
            let local_released = self.local.released();
            let global_released = self.global.released();

            let local = self.local.try_acquire_up_to(self.local.limit());
            if local == 0 {
                debug!(in_flight = self.local.in_flight(), "consumer at its load limit; pausing fetch");
                tokio::select! {
                    _ = local_released => {}
                    _ = self.stop.changed() => return None,
                }
                continue;
            }

            let granted = self.global.try_acquire_up_to(local);
            self.local.release(local - granted);
            if granted > 0 {
                return Some(granted);
            }

            debug!(in_flight = self.global.in_flight(), "process at its load limit; pausing fetch");
            tokio::select! {
                _ = global_released => {}
                _ = self.stop.changed() => return None,
            }
        }
    }

    fn release(&self, count: usize) {
        self.global.release(count);
        self.local.release(count);
    }

    fn dispatch(&self, record: ConsumedRecord) {
        let permit = LoadPermit::reserved(self.local.clone(), self.global.clone());
        let mut slot = self.sequencer.enqueue(&record.key);
        let handler = self.handler.clone();
        let subscription = self.subscription.clone();

        tokio::spawn(async move {
            let _permit = permit;
            slot.wait_turn().await;

            match handler.handle(&record).await {
                Ok(()) => debug!(position = %record.position, "record handled"),
                Err(e) => warn!(
                    position = %record.position,
                    key = %record.key,
                    error = %e,
                    "record handling failed; committing and moving on"
                ),
            }

            if let Err(e) = subscription.commit(&record.position).await {
                warn!(
                    position = %record.position,
                    error = %e,
                    "commit failed; record may be redelivered"
                );
            }
            drop(slot);
        });
    }

    async fn drain(&self) {
        loop {
            let released = self.local.released();
            if self.local.in_flight() == 0 {
                return;
            }
            released.await;
        }
    }

    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop.changed() => {}
        }
    }

    /// A dropped sender counts as a stop request.
    fn stop_requested(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use circstore_core::TenantId;
    use circstore_events::{
        AdminConnection, AdminConnector, HandlerError, InMemoryBroker, NewTopic, ProducerRecord,
        RecordHeaders, RecordProducer,
    };
    use tokio::sync::{Notify, Semaphore};

    const ITEM: TopicIdentity = TopicIdentity::new("inventory", "item", 4);

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).unwrap()
    }

    async fn broker_for(tenants: &[&str]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        let mut admin = broker.connect().await.unwrap();
        let topics: Vec<NewTopic> = tenants
            .iter()
            .map(|t| NewTopic {
                name: ITEM.qualify(&Environment::default(), &tenant(t)),
                partitions: ITEM.partitions(),
                replication_factor: 1,
            })
            .collect();
        admin.create_topics(&topics).await.unwrap();
        admin.close().await;
        broker
    }

    async fn send(broker: &InMemoryBroker, tenant_name: &str, key: &str, payload: &str) {
        broker
            .send(ProducerRecord {
                topic: ITEM.qualify(&Environment::default(), &tenant(tenant_name)),
                key: key.to_string(),
                headers: RecordHeaders::new(),
                payload: payload.to_string(),
            })
            .await
            .unwrap();
    }

    fn consumer(broker: &InMemoryBroker, load_limit: usize, global: Arc<LoadSensor>) -> ConsumerGroup {
        let settings = ConsumerSettings::for_topic(ITEM, "mod-circulation-storage", "test", load_limit)
            .with_poll_interval(Duration::from_millis(10));
        ConsumerGroup::new(ITEM, Environment::default(), settings, Arc::new(broker.clone()), global)
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Records payloads in handling order; fails on payloads starting with "fail".
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordHandler for RecordingHandler {
        async fn handle(&self, record: &ConsumedRecord) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(record.payload.clone());
            if record.payload.starts_with("fail") {
                return Err(HandlerError::Failed(record.payload.clone()));
            }
            Ok(())
        }
    }

    /// Blocks every record until the test hands out a permit.
    struct GatedHandler {
        active: AtomicUsize,
        max_active: AtomicUsize,
        handled: AtomicUsize,
        gate: Semaphore,
    }

    impl Default for GatedHandler {
        fn default() -> Self {
            Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                handled: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordHandler for GatedHandler {
        async fn handle(&self, _record: &ConsumedRecord) -> Result<(), HandlerError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))?
                .forget();
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn settings_derive_group_and_client_ids() {
        let settings = ConsumerSettings::for_topic(ITEM, "mod-circulation-storage", "node-7", 5);
        assert_eq!(settings.group_id, "inventory.item.mod-circulation-storage");
        assert_eq!(settings.client_id, "mod-circulation-storage-node-7");
    }

    #[tokio::test]
    async fn handles_and_commits_records_of_every_tenant() {
        let broker = broker_for(&["diku", "college"]).await;
        send(&broker, "diku", "i1", "a").await;
        send(&broker, "college", "i2", "b").await;

        let handler = Arc::new(RecordingHandler::default());
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        group.start(handler.clone()).await.unwrap();
        assert_eq!(group.status(), ConsumerStatus::Running);

        eventually("both records", || handler.seen().len() == 2).await;
        group.stop().await.unwrap();

        let mut seen = handler.seen();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(group.status(), ConsumerStatus::Stopped);
        assert_eq!(group.state().in_flight, 0);
    }

    #[tokio::test]
    async fn never_exceeds_its_load_limit() {
        let broker = broker_for(&["diku"]).await;
        for i in 0..7 {
            send(&broker, "diku", &format!("item-{i}"), &format!("r{i}")).await;
        }

        let handler = Arc::new(GatedHandler::default());
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        group.start(handler.clone()).await.unwrap();

        eventually("five records in flight", || handler.active.load(Ordering::SeqCst) == 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.active.load(Ordering::SeqCst), 5);
        assert_eq!(group.state().in_flight, 5);
        assert_eq!(group.state().load_limit, 5);

        // Two completions let exactly the two waiting records in.
        handler.gate.add_permits(2);
        eventually("two records handled", || handler.handled.load(Ordering::SeqCst) == 2).await;
        eventually("excess records dispatched", || handler.active.load(Ordering::SeqCst) == 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!(handler.active.load(Ordering::SeqCst), 5);
        assert_eq!(group.state().in_flight, 5);

        handler.gate.add_permits(5);
        eventually("all records", || handler.handled.load(Ordering::SeqCst) == 7).await;
        group.stop().await.unwrap();

        assert_eq!(handler.max_active.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn shared_sensor_caps_all_consumers_together() {
        let broker = broker_for(&["diku"]).await;
        for i in 0..6 {
            send(&broker, "diku", &format!("item-{i}"), "r").await;
        }

        let global = Arc::new(LoadSensor::new(3));
        let handler = Arc::new(GatedHandler::default());
        let group = consumer(&broker, 5, global.clone());
        group.start(handler.clone()).await.unwrap();

        eventually("three records in flight", || handler.active.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(global.in_flight(), 3);
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 3);

        handler.gate.add_permits(6);
        eventually("all records", || handler.handled.load(Ordering::SeqCst) == 6).await;
        group.stop().await.unwrap();
        assert_eq!(global.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_records_are_still_committed() {
        let broker = broker_for(&["diku"]).await;
        send(&broker, "diku", "k", "fail-1").await;
        send(&broker, "diku", "k", "ok-2").await;

        let handler = Arc::new(RecordingHandler::default());
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        group.start(handler.clone()).await.unwrap();
        eventually("both records", || handler.seen().len() == 2).await;
        group.stop().await.unwrap();

        let topic = ITEM.qualify(&Environment::default(), &tenant("diku"));
        let partition = circstore_events::partition_for_key("k", ITEM.partitions());
        assert_eq!(
            broker.committed_watermark(&group.settings().group_id, topic.as_str(), partition),
            2
        );

        // Nothing is redelivered after a restart.
        group.start(handler.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        group.stop().await.unwrap();
        assert_eq!(handler.seen().len(), 2);
    }

    #[tokio::test]
    async fn same_key_records_are_handled_in_order() {
        let broker = broker_for(&["diku"]).await;
        for i in 0..20 {
            send(&broker, "diku", "item-1", &format!("{i:02}")).await;
        }

        let handler = Arc::new(RecordingHandler::default());
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        group.start(handler.clone()).await.unwrap();
        eventually("every record", || handler.seen().len() == 20).await;
        group.stop().await.unwrap();

        let expected: Vec<String> = (0..20).map(|i| format!("{i:02}")).collect();
        assert_eq!(handler.seen(), expected);
    }

    #[tokio::test]
    async fn lifecycle_edges() {
        let broker = broker_for(&["diku"]).await;
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        let handler = Arc::new(RecordingHandler::default());

        // Stopping a stopped consumer is a no-op.
        group.stop().await.unwrap();

        group.start(handler.clone()).await.unwrap();
        assert_eq!(
            group.start(handler.clone()).await,
            Err(ConsumerError::InvalidState {
                operation: "start",
                status: ConsumerStatus::Running
            })
        );

        group.stop().await.unwrap();
        group.stop().await.unwrap();
        assert_eq!(group.status(), ConsumerStatus::Stopped);

        // Restart after stop.
        group.start(handler).await.unwrap();
        group.stop().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_stop_still_completes_after_drain() {
        let broker = broker_for(&["diku"]).await;
        send(&broker, "diku", "item-1", "r").await;

        let handler = Arc::new(GatedHandler::default());
        let group = consumer(&broker, 5, Arc::new(LoadSensor::new(50)));
        group.start(handler.clone()).await.unwrap();
        eventually("record in flight", || handler.active.load(Ordering::SeqCst) == 1).await;

        let timed_out = tokio::time::timeout(Duration::from_millis(20), group.stop()).await;
        assert!(timed_out.is_err());
        assert_eq!(group.status(), ConsumerStatus::Stopping);
        assert_eq!(
            group.start(handler.clone()).await,
            Err(ConsumerError::InvalidState {
                operation: "start",
                status: ConsumerStatus::Stopping
            })
        );

        handler.gate.add_permits(1);
        eventually("consumer stopped", || group.status() == ConsumerStatus::Stopped).await;
        assert_eq!(group.state().in_flight, 0);

        group.stop().await.unwrap();
        group.start(handler.clone()).await.unwrap();
        group.stop().await.unwrap();
        assert_eq!(group.status(), ConsumerStatus::Stopped);
    }

    #[tokio::test]
    async fn second_stop_waits_for_the_first_drain() {
        let broker = broker_for(&["diku"]).await;
        send(&broker, "diku", "item-1", "r").await;

        let handler = Arc::new(GatedHandler::default());
        let group = Arc::new(consumer(&broker, 5, Arc::new(LoadSensor::new(50))));
        group.start(handler.clone()).await.unwrap();
        eventually("record in flight", || handler.active.load(Ordering::SeqCst) == 1).await;

        let first = {
            let group = group.clone();
            tokio::spawn(async move { group.stop().await })
        };
        eventually("stopping", || group.status() == ConsumerStatus::Stopping).await;

        let second = {
            let group = group.clone();
            tokio::spawn(async move { group.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        handler.gate.add_permits(1);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(group.status(), ConsumerStatus::Stopped);
    }

    /// Subscribe blocks until released, or fails outright.
    struct StallingConnector {
        entered: Notify,
        release: Notify,
        fail: bool,
        broker: InMemoryBroker,
    }

    #[async_trait]
    impl ConsumerConnector for StallingConnector {
        async fn subscribe(
            &self,
            request: SubscriptionRequest,
        ) -> Result<Arc<dyn Subscription>, BrokerError> {
            if self.fail {
                return Err(BrokerError::Unavailable("no broker".to_string()));
            }
            self.entered.notify_one();
            self.release.notified().await;
            self.broker.subscribe(request).await
        }
    }

    #[tokio::test]
    async fn stop_while_starting_is_rejected() {
        let connector = Arc::new(StallingConnector {
            entered: Notify::new(),
            release: Notify::new(),
            fail: false,
            broker: broker_for(&["diku"]).await,
        });
        let settings = ConsumerSettings::for_topic(ITEM, "m", "i", 5);
        let group = Arc::new(ConsumerGroup::new(
            ITEM,
            Environment::default(),
            settings,
            connector.clone(),
            Arc::new(LoadSensor::new(50)),
        ));

        let starting = {
            let group = group.clone();
            tokio::spawn(async move { group.start(Arc::new(RecordingHandler::default())).await })
        };
        connector.entered.notified().await;

        assert_eq!(group.status(), ConsumerStatus::Starting);
        assert_eq!(
            group.stop().await,
            Err(ConsumerError::InvalidState {
                operation: "stop",
                status: ConsumerStatus::Starting
            })
        );

        connector.release.notify_one();
        starting.await.unwrap().unwrap();
        assert_eq!(group.status(), ConsumerStatus::Running);
        group.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_subscribe_returns_to_stopped() {
        let connector = Arc::new(StallingConnector {
            entered: Notify::new(),
            release: Notify::new(),
            fail: true,
            broker: InMemoryBroker::new(),
        });
        let group = ConsumerGroup::new(
            ITEM,
            Environment::default(),
            ConsumerSettings::for_topic(ITEM, "m", "i", 5),
            connector,
            Arc::new(LoadSensor::new(50)),
        );

        let err = group
            .start(Arc::new(RecordingHandler::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Subscribe(BrokerError::Unavailable(_))));
        assert_eq!(group.status(), ConsumerStatus::Stopped);
    }
}
