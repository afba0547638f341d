mod batch;
mod event;
mod idempotency;

pub use batch::{Batch, BatchStatus, Phase};
pub use event::{BatchEvent, EventType};
pub use idempotency::{IdempotencyRecord, IdempotencyState};
