// Order intents, broker seam and the coordinator that owns them
pub mod coordinator;
pub mod gateway;
pub mod intent;
pub mod paper;

pub use coordinator::{CoordinatorEffect, ExecutionCoordinator, IntentExposure};
pub use gateway::{
    GatewayError, GatewayEvent, OrderGateway, OrderId, OrderKind, OrderRequest, OrderSpec,
};
pub use intent::{Fingerprint, Intent};
pub use paper::PaperGateway;
