pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod permission;
pub mod process;
pub mod protocol;
pub mod resolver;
pub mod routing;
pub mod session;
pub mod stream;

pub use broker::{
    shower_fn, DecisionFuture, DecisionRequest, DecisionResponse, DecisionShower, DecisionSource,
    RequestBroker, RequestKind, Resolution,
};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use permission::{PermissionMemory, PermissionMode};
pub use routing::TenantRouter;
pub use session::{BridgeSession, Channel, SendRequest, TurnOutcome, TurnUpdate};
