pub mod api;
pub mod cache;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod hosts;
pub mod ledger;
pub mod license;
pub mod metrics;
pub mod monitoring;
pub mod node;
pub mod ratelimit;
pub mod rates;
pub mod sales;

pub use api::{create_router, AppState, Backends};
pub use config::Config;
pub use envelope::Envelope;
pub use error::{ApiError, ApiResult};
