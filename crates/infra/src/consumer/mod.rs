//! Load-limited group consumption.

pub mod group;
pub mod load_sensor;
pub mod ordering;

pub use group::{ConsumerError, ConsumerGroup, ConsumerSettings, ConsumerState, ConsumerStatus};
pub use load_sensor::{LoadPermit, LoadSensor};
pub use ordering::{KeySequencer, SequenceSlot};
