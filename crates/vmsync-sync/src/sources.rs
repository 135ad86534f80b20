//! Where the pipeline reads raw circuit and planned-unit rows from.

use std::sync::Arc;

use async_trait::async_trait;
use vmsync_adapters::ResponseTransformer;
use vmsync_core::Record;
use vmsync_storage::{RemoteError, RemoteQueryClient};

use crate::queries::RemoteQueries;

#[async_trait]
pub trait CircuitSource: Send + Sync {
    async fn fetch_circuits(&self, status_filter: &[String]) -> Result<Vec<Record>, RemoteError>;
}

#[async_trait]
pub trait PlannedUnitSource: Send + Sync {
    /// Every planned unit under the work order, across all of its extensions.
    async fn fetch_planned_units(&self, work_order: &str) -> Result<Vec<Record>, RemoteError>;
}

/// Reads both row kinds through the remote query client.
pub struct RemoteSource {
    client: Arc<RemoteQueryClient>,
    queries: Arc<dyn RemoteQueries>,
    user_id: Option<String>,
}

impl RemoteSource {
    pub fn new(client: Arc<RemoteQueryClient>, queries: Arc<dyn RemoteQueries>) -> Self {
        Self {
            client,
            queries,
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn client(&self) -> &Arc<RemoteQueryClient> {
        &self.client
    }
}

#[async_trait]
impl CircuitSource for RemoteSource {
    async fn fetch_circuits(&self, status_filter: &[String]) -> Result<Vec<Record>, RemoteError> {
        let sql = self.queries.circuits_sql(status_filter);
        let response = self.client.query(&sql, self.user_id.as_deref()).await?;
        Ok(ResponseTransformer::Tabular.transform(&response.data_set))
    }
}

#[async_trait]
impl PlannedUnitSource for RemoteSource {
    async fn fetch_planned_units(&self, work_order: &str) -> Result<Vec<Record>, RemoteError> {
        let sql = self.queries.planned_units_sql(work_order);
        let response = self.client.query(&sql, self.user_id.as_deref()).await?;
        Ok(ResponseTransformer::ChunkedJson.transform(&response.data_set))
    }
}
