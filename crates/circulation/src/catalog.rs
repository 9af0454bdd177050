//! Static topic catalog.
//!
//! Both mappings are closed: every stored collection publishes to exactly one
//! topic, and every consumed topic resolves to exactly one handler at startup.

use circstore_events::TopicIdentity;

pub const CIRCULATION_MODULE: &str = "circulation";
pub const INVENTORY_MODULE: &str = "inventory";

const LOAN_TOPIC: TopicIdentity = TopicIdentity::new(CIRCULATION_MODULE, "loan", 10);
const REQUEST_TOPIC: TopicIdentity = TopicIdentity::new(CIRCULATION_MODULE, "request", 10);
const CHECK_IN_TOPIC: TopicIdentity = TopicIdentity::new(CIRCULATION_MODULE, "check-in", 10);

const ITEM_TOPIC: TopicIdentity = TopicIdentity::new(INVENTORY_MODULE, "item", 10);
const SERVICE_POINT_TOPIC: TopicIdentity = TopicIdentity::new(INVENTORY_MODULE, "service-point", 10);

/// Record collections owned by this module; each publishes its own change events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Collection {
    Loan,
    Request,
    CheckIn,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Loan, Collection::Request, Collection::CheckIn];

    pub fn topic(self) -> TopicIdentity {
        match self {
            Collection::Loan => LOAN_TOPIC,
            Collection::Request => REQUEST_TOPIC,
            Collection::CheckIn => CHECK_IN_TOPIC,
        }
    }

    /// Table name in the tenant's storage schema.
    pub fn table(self) -> &'static str {
        match self {
            Collection::Loan => "loan",
            Collection::Request => "request",
            Collection::CheckIn => "check_in",
        }
    }
}

impl core::fmt::Display for Collection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.table())
    }
}

/// Upstream topics this module consumes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConsumedTopic {
    InventoryItem,
    InventoryServicePoint,
}

impl ConsumedTopic {
    pub const ALL: [ConsumedTopic; 2] = [ConsumedTopic::InventoryItem, ConsumedTopic::InventoryServicePoint];

    pub fn topic(self) -> TopicIdentity {
        match self {
            ConsumedTopic::InventoryItem => ITEM_TOPIC,
            ConsumedTopic::InventoryServicePoint => SERVICE_POINT_TOPIC,
        }
    }
}

/// Topics provisioned for every enabled tenant.
pub fn produced_topics() -> Vec<TopicIdentity> {
    Collection::ALL.iter().map(|c| c.topic()).collect()
}
