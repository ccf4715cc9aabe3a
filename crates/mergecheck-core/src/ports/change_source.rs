//! ChangeRequestSource port: where change-request metadata comes from.

use async_trait::async_trait;

use crate::domain::GenerateError;
use crate::domain::change::{ChangeRequest, ChangeRequestRef};

/// Yields the metadata record for a change request.
///
/// Remote code-hosting APIs are outside the core; `impls::json_source` reads
/// records exported to a JSON file.
#[async_trait]
pub trait ChangeRequestSource: Send + Sync {
    async fn fetch(&self, reference: &ChangeRequestRef) -> Result<ChangeRequest, GenerateError>;
}
