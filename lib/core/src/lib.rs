pub mod config;
pub mod error;
pub mod module;
pub mod tenant;
pub mod types;

pub use config::ServiceConfig;
pub use error::ServiceError;
pub use module::Module;
pub use tenant::{RequestId, Tenant};
pub use types::{ListParams, ListResult, new_id, now_rfc3339};
