pub mod claim;
pub mod commit;
pub mod config;
pub mod errors;
pub mod input;
pub mod position;
pub mod source;
pub mod telemetry;

pub use claim::RecordCallback;
pub use commit::PendingPosition;
pub use config::{InputConfig, InputInfo, KafkaOptions};
pub use errors::{InputError, Result};
pub use input::{KafkaInput, PluginStatus, StatusFlag};
pub use source::ConsumerRecord;
pub use source::kafka::KafkaConnector;
