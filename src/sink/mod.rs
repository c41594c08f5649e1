//! Payload sinks: where successful results land before an item is completed.
//!
//! ## Directory Structure (`JsonDirSink`)
//!
//! ```text
//! {output_dir}/
//! └── {partition_key}/
//!     ├── item-1.json
//!     └── item-2.json
//! ```

pub mod local;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::WorkItem;

pub use local::JsonDirSink;

/// Trait for payload persistence backends.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// Persist one payload. Storing the same item twice overwrites it.
    async fn store(&self, item: &WorkItem, payload: &Value) -> Result<()>;
}

/// Sink that discards every payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl PayloadSink for NullSink {
    async fn store(&self, _item: &WorkItem, _payload: &Value) -> Result<()> {
        Ok(())
    }
}
