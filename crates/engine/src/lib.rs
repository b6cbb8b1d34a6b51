pub mod config;
pub mod connectivity;
pub mod error;
pub mod gateway;
pub mod http;
pub mod ownership;
pub mod reconciler;
pub mod service;

pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use error::{EngineError, GatewayError, RetryClass};
pub use gateway::{CreateOutcome, CreateRequest, RemoteGateway, RemoteRecord, create_with_fallback, with_timeout};
pub use http::HttpGateway;
pub use ownership::{AccessVerdict, OwnershipVerdict, OwnershipVerifier};
pub use reconciler::{EntityOutcome, PassOutcome, PassReport, Reconciler};
pub use service::{DeleteOutcome, DiscardOutcome, EntityView, FieldService, RowStatus};
