//! Process wiring: tenant lifecycle and the consumers of upstream topics.

pub mod service;

pub use service::{BrokerHandles, CirculationEventsService, ServiceError};
