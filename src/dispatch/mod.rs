//! Analysis dispatch: the engine catalogue, wire messages and the
//! partitioned message bus that carries them.

pub mod bus;
pub mod engine;
pub mod error;
pub mod message;

pub use bus::{Envelope, MessageBus, MessagePublisher, PublishReceipt};
pub use engine::{
    EngineParams, EngineType, ExecutionMode, ImageAiParams, MetadataParams,
    TraditionalImageParams, VideoAiParams, VideoNoiseParams,
};
pub use error::{DispatchError, DispatchResult};
pub use message::{DispatchMessage, ResultMessage, SCHEMA_VERSION};
