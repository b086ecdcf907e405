use async_trait::async_trait;
use resolver_core::{DependencyTracker, ReasonResolved, ResolverError, ResolverResult};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct ResolveTaskPayload<'a> {
    task_id: Uuid,
    task_group_id: Uuid,
    scheduler_id: &'a str,
    resolution: String,
}

/// Propagates a task's terminal resolution to the scheduler's dependency
/// graph endpoint over HTTP.
pub struct HttpDependencyTracker {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDependencyTracker {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with default TLS backend");
        Self { client, endpoint }
    }
}

#[async_trait]
impl DependencyTracker for HttpDependencyTracker {
    async fn resolve_task(
        &self,
        task_id: Uuid,
        task_group_id: Uuid,
        scheduler_id: &str,
        resolution: ReasonResolved,
    ) -> ResolverResult<()> {
        let payload = ResolveTaskPayload {
            task_id,
            task_group_id,
            scheduler_id,
            resolution: resolution.to_string(),
        };

        self.client
            .post(format!("{}/tasks/{task_id}/resolve", self.endpoint))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ResolverError::Publish(anyhow::anyhow!(e)))?
            .error_for_status()
            .map_err(|e| ResolverError::Publish(anyhow::anyhow!(e)))?;

        Ok(())
    }
}
