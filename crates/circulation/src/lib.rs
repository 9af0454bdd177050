//! Circulation domain module.
//!
//! Topic catalog, upstream snapshots and the search-index projection rules,
//! implemented purely as deterministic domain logic (no IO, no broker, no storage).

pub mod catalog;
pub mod item;
pub mod search_index;
pub mod service_point;

pub use catalog::{CIRCULATION_MODULE, Collection, ConsumedTopic, INVENTORY_MODULE, produced_topics};
pub use item::{ItemSnapshot, ShelvingLocation, shelving_changed};
pub use search_index::{
    CallNumberComponents, ITEM_ID_FIELD, PICKUP_SERVICE_POINT_ID_FIELD, SEARCH_INDEX_FIELD,
    SearchIndex,
};
pub use service_point::ServicePointSnapshot;
