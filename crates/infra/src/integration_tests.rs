//! Integration tests for the full change-data pipeline.
//!
//! Tests: Provision → Repository write → Upstream event → ConsumerGroup →
//! Handler → Request rewrite → Request event
//!
//! Verifies:
//! - Upstream item changes reach dependent requests and republish them
//! - Tenants never see each other's records
//! - A failing record is committed and does not block its partition
//! - Only allow-listed headers travel from consumed to produced records

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};

use circstore_circulation::{Collection, ConsumedTopic, produced_topics};
use circstore_core::TenantId;
use circstore_events::{
    Environment, EventEnvelope, EventType, ForwardedHeaders, InMemoryBroker, OKAPI_TENANT_HEADER,
    OKAPI_URL_HEADER, ProducerRecord, RecordHeaders, RecordProducer, partition_for_key,
};

use crate::consumer::{ConsumerGroup, ConsumerSettings, ConsumerStatus, LoadSensor};
use crate::handlers::handler_for;
use crate::provisioning::{RetryPolicy, TopicProvisioner};
use crate::publisher::{EnvelopeBuilder, EventPublisher};
use crate::repository::RecordRepository;
use crate::store::{DocumentStore, InMemoryDocumentStore};

const MODULE_NAME: &str = "mod-circulation-storage";

fn tenant(name: &str) -> TenantId {
    TenantId::parse(name).unwrap()
}

struct Pipeline {
    broker: InMemoryBroker,
    store: Arc<InMemoryDocumentStore>,
    repository: RecordRepository,
    /// Stands in for the inventory module publishing its own changes.
    inventory: EventPublisher,
    consumers: Vec<ConsumerGroup>,
}

impl Pipeline {
    async fn new(tenants: &[&str]) -> Self {
        let broker = InMemoryBroker::new();
        let environment = Environment::default();
        let upstream_topics = ConsumedTopic::ALL.iter().map(|t| t.topic()).collect();

        let own = TopicProvisioner::new(
            Arc::new(broker.clone()),
            produced_topics(),
            1,
            RetryPolicy::default(),
        );
        let upstream = TopicProvisioner::new(
            Arc::new(broker.clone()),
            upstream_topics,
            1,
            RetryPolicy::default(),
        );
        for name in tenants {
            own.ensure_topics(&tenant(name), &environment).await.unwrap();
            upstream.ensure_topics(&tenant(name), &environment).await.unwrap();
        }

        let builder = EnvelopeBuilder::new(environment, None, 4_000_000);
        let store = Arc::new(InMemoryDocumentStore::new());
        let repository = RecordRepository::new(
            store.clone(),
            EventPublisher::new(Arc::new(broker.clone()), builder.clone()),
        );

        Self {
            inventory: EventPublisher::new(Arc::new(broker.clone()), builder),
            broker,
            store,
            repository,
            consumers: Vec::new(),
        }
    }

    async fn start_consumers(&mut self, load_limit: usize) {
        let global = Arc::new(LoadSensor::new(load_limit * ConsumedTopic::ALL.len()));
        for consumed in ConsumedTopic::ALL {
            let settings = ConsumerSettings::for_topic(consumed.topic(), MODULE_NAME, "it", load_limit)
                .with_poll_interval(Duration::from_millis(10));
            let group = ConsumerGroup::new(
                consumed.topic(),
                Environment::default(),
                settings,
                Arc::new(self.broker.clone()),
                global.clone(),
            );
            group
                .start(handler_for(consumed, self.repository.clone()))
                .await
                .unwrap();
            self.consumers.push(group);
        }
    }

    async fn stop_consumers(&self) {
        for group in &self.consumers {
            group.stop().await.unwrap();
            assert_eq!(group.status(), ConsumerStatus::Stopped);
        }
    }

    async fn create_request(&self, tenant_name: &str, item_id: &str, search_index: JsonValue) -> JsonValue {
        let (stored, _) = self
            .repository
            .create(
                &tenant(tenant_name),
                Collection::Request,
                json!({"itemId": item_id, "pickupServicePointId": "sp-1", "searchIndex": search_index}),
                &ForwardedHeaders::default(),
            )
            .await
            .unwrap();
        stored.document
    }

    async fn search_index(&self, tenant_name: &str, request: &JsonValue) -> JsonValue {
        let id = crate::store::document_id(request).unwrap();
        self.store
            .get(&tenant(tenant_name), Collection::Request, id)
            .await
            .unwrap()
            .unwrap()
            .document["searchIndex"]
            .clone()
    }

    fn request_events(&self, tenant_name: &str) -> Vec<(RecordHeaders, EventEnvelope)> {
        self.broker
            .records(&format!("folio.{tenant_name}.circulation.request"))
            .into_iter()
            .map(|r| {
                let envelope = EventEnvelope::from_json(&r.payload).unwrap();
                (r.headers, envelope)
            })
            .collect()
    }

    async fn publish_item_update(&self, tenant_name: &str, old: JsonValue, new: JsonValue, caller: &ForwardedHeaders) {
        let key = new["id"].as_str().unwrap().to_string();
        self.inventory
            .publish_updated(
                ConsumedTopic::InventoryItem.topic(),
                &tenant(tenant_name),
                &key,
                &old,
                &new,
                caller,
            )
            .await
            .unwrap();
    }
}

fn item(id: &str, prefix: &str, shelving_order: &str) -> JsonValue {
    json!({
        "id": id,
        "barcode": "000111",
        "effectiveCallNumberComponents": {"prefix": prefix, "callNumber": "PR6056", "suffix": "c.2"},
        "effectiveShelvingOrder": shelving_order
    })
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn item_change_reaches_requests_and_is_republished() {
    let mut pipeline = Pipeline::new(&["diku"]).await;
    let index = json!({
        "callNumberComponents": {"prefix": "OLD", "callNumber": "PR6056", "suffix": "c.2"},
        "shelvingOrder": "PR 46056 C 12",
        "pickupServicePointName": "Circ Desk 1"
    });
    let request = pipeline.create_request("diku", "item-1", index).await;
    pipeline.start_consumers(5).await;

    pipeline
        .publish_item_update(
            "diku",
            item("item-1", "OLD", "PR 46056 C 12"),
            item("item-1", "NEW", "PR 46056 C 12"),
            &ForwardedHeaders::default(),
        )
        .await;

    eventually("request republished", || pipeline.request_events("diku").len() == 2).await;
    pipeline.stop_consumers().await;

    let index = pipeline.search_index("diku", &request).await;
    assert_eq!(index["callNumberComponents"]["prefix"], "NEW");
    assert_eq!(index["pickupServicePointName"], "Circ Desk 1");

    let events = pipeline.request_events("diku");
    let (_, updated) = &events[1];
    assert_eq!(updated.event_type(), EventType::Updated);
    assert_eq!(updated.old().unwrap()["searchIndex"]["callNumberComponents"]["prefix"], "OLD");
    assert_eq!(updated.new_value().unwrap()["searchIndex"]["callNumberComponents"]["prefix"], "NEW");
}

#[tokio::test]
async fn tenants_are_isolated_end_to_end() {
    let mut pipeline = Pipeline::new(&["diku", "college"]).await;
    let index = json!({"shelvingOrder": "A 1"});
    let diku_request = pipeline.create_request("diku", "item-1", index.clone()).await;
    let college_request = pipeline.create_request("college", "item-1", index.clone()).await;
    pipeline.start_consumers(5).await;

    pipeline
        .publish_item_update(
            "diku",
            item("item-1", "P", "A 1"),
            item("item-1", "P", "B 2"),
            &ForwardedHeaders::default(),
        )
        .await;

    eventually("diku request republished", || pipeline.request_events("diku").len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.stop_consumers().await;

    assert_eq!(pipeline.search_index("diku", &diku_request).await["shelvingOrder"], "B 2");
    assert_eq!(pipeline.search_index("college", &college_request).await, index);
    assert_eq!(pipeline.request_events("college").len(), 1);
}

#[tokio::test]
async fn failing_record_is_committed_and_does_not_block_its_key() {
    let mut pipeline = Pipeline::new(&["diku"]).await;
    let request = pipeline.create_request("diku", "item-1", json!({})).await;
    pipeline.start_consumers(5).await;

    let topic = ConsumedTopic::InventoryItem
        .topic()
        .qualify(&Environment::default(), &tenant("diku"));
    pipeline
        .broker
        .send(ProducerRecord {
            topic: topic.clone(),
            key: "item-1".to_string(),
            headers: RecordHeaders::new(),
            payload: "{\"not\": \"an envelope\"".to_string(),
        })
        .await
        .unwrap();
    pipeline
        .publish_item_update(
            "diku",
            item("item-1", "A", "X 1"),
            item("item-1", "B", "X 1"),
            &ForwardedHeaders::default(),
        )
        .await;

    let group = pipeline.consumers[0].settings().group_id.clone();
    let partition = partition_for_key("item-1", ConsumedTopic::InventoryItem.topic().partitions());
    eventually("both records committed", || {
        pipeline
            .broker
            .committed_watermark(&group, topic.as_str(), partition)
            == 2
    })
    .await;
    pipeline.stop_consumers().await;

    assert_eq!(
        pipeline.search_index("diku", &request).await["callNumberComponents"]["prefix"],
        "B"
    );
}

#[tokio::test]
async fn only_allow_listed_headers_are_carried_onto_request_events() {
    let mut pipeline = Pipeline::new(&["diku"]).await;
    pipeline.create_request("diku", "item-1", json!({})).await;
    pipeline.start_consumers(5).await;

    let caller = ForwardedHeaders::from_pairs([
        ("X-Okapi-Url", "http://okapi:9130"),
        ("X-Okapi-Token", "secret"),
        ("X-Request-Id", "abc"),
    ]);
    pipeline
        .publish_item_update("diku", item("item-1", "A", "X"), item("item-1", "B", "Y"), &caller)
        .await;

    eventually("request republished", || pipeline.request_events("diku").len() == 2).await;
    pipeline.stop_consumers().await;

    let events = pipeline.request_events("diku");
    let (headers, _) = &events[1];
    assert_eq!(headers.len(), 2);
    assert_eq!(headers[OKAPI_URL_HEADER], "http://okapi:9130");
    assert_eq!(headers[OKAPI_TENANT_HEADER], "diku");
}

#[tokio::test]
async fn redelivered_update_after_restart_changes_nothing() {
    let mut pipeline = Pipeline::new(&["diku"]).await;
    let request = pipeline.create_request("diku", "item-1", json!({})).await;
    pipeline.start_consumers(5).await;

    let old = item("item-1", "A", "X");
    let new = item("item-1", "B", "Y");
    pipeline
        .publish_item_update("diku", old.clone(), new.clone(), &ForwardedHeaders::default())
        .await;
    eventually("first delivery applied", || pipeline.request_events("diku").len() == 2).await;
    let after_first = pipeline.search_index("diku", &request).await;
    let writes = pipeline.store.write_count();

    // A producer retry duplicates the record.
    pipeline
        .publish_item_update("diku", old, new, &ForwardedHeaders::default())
        .await;
    let group = pipeline.consumers[0].settings().group_id.clone();
    let topic = "folio.diku.inventory.item".to_string();
    let partition = partition_for_key("item-1", ConsumedTopic::InventoryItem.topic().partitions());
    eventually("duplicate committed", || {
        pipeline.broker.committed_watermark(&group, &topic, partition) == 2
    })
    .await;
    pipeline.stop_consumers().await;

    assert_eq!(pipeline.search_index("diku", &request).await, after_first);
    assert_eq!(pipeline.store.write_count(), writes);
    assert_eq!(pipeline.request_events("diku").len(), 2);
}
