use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use morrigan_core::error::Result;
use morrigan_core::model::ServerInstanceRecord;
use morrigan_core::store::{DataStore, Filter};

const INSTANCES: &str = "instances";
const CHECK_IN_INTERVAL: Duration = Duration::from_secs(30);

/// Upserts this server's liveness row on a fixed interval while running,
/// and writes a final `live=false` row on stop (§4.8).
pub struct InstanceReporter {
    data: Arc<dyn DataStore>,
    instance_id: Uuid,
    components: Vec<String>,
    runtime_info: serde_json::Value,
    task: Option<JoinHandle<()>>,
}

impl InstanceReporter {
    pub fn new(
        data: Arc<dyn DataStore>,
        instance_id: Uuid,
        components: Vec<String>,
        runtime_info: serde_json::Value,
    ) -> Self {
        Self {
            data,
            instance_id,
            components,
            runtime_info,
            task: None,
        }
    }

    /// Writes the initial row and starts the refresh loop. Called on
    /// reaching `READY`.
    pub async fn start(&mut self) -> Result<()> {
        self.check_in(true, None).await?;

        let data = self.data.clone();
        let instance_id = self.instance_id;
        let components = self.components.clone();
        let runtime_info = self.runtime_info.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHECK_IN_INTERVAL);
            ticker.tick().await; // skip the immediate first tick; start() already wrote one
            loop {
                ticker.tick().await;
                let record = ServerInstanceRecord {
                    id: instance_id,
                    components: components.clone(),
                    runtime_info: runtime_info.clone(),
                    live: true,
                    check_in_time: Utc::now(),
                    stop_reason: None,
                };
                if let Err(e) = upsert(&data, &record).await {
                    tracing::warn!(error = %e, "instance reporter check-in failed");
                }
            }
        }));
        Ok(())
    }

    /// Stops the refresh loop and writes the final `live=false` row.
    /// Called on entering `STOPPING`.
    pub async fn stop(&mut self, reason: &str) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.check_in(false, Some(reason.to_string())).await
    }

    async fn check_in(&self, live: bool, stop_reason: Option<String>) -> Result<()> {
        let record = ServerInstanceRecord {
            id: self.instance_id,
            components: self.components.clone(),
            runtime_info: self.runtime_info.clone(),
            live,
            check_in_time: Utc::now(),
            stop_reason,
        };
        upsert(&self.data, &record).await
    }
}

async fn upsert(data: &Arc<dyn DataStore>, record: &ServerInstanceRecord) -> Result<()> {
    let filter = Filter::new().eq("id", record.id.to_string());
    let doc = serde_json::to_value(record)
        .map_err(|e| morrigan_core::error::Error::server_error(format!("serialization failed: {e}")))?;
    let replaced = data.replace_one(INSTANCES, &filter, doc.clone()).await?;
    if !replaced {
        data.insert_one(INSTANCES, doc).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use morrigan_storage::memory::InMemoryDatabase;

    #[tokio::test]
    async fn start_writes_a_live_row() {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let id = Uuid::new_v4();
        let mut reporter = InstanceReporter::new(data.clone(), id, vec!["auth".to_string()], serde_json::json!({}));
        reporter.start().await.unwrap();

        let doc = data
            .find_one(INSTANCES, &Filter::new().eq("id", id.to_string()))
            .await
            .unwrap()
            .unwrap();
        let record: ServerInstanceRecord = serde_json::from_value(doc).unwrap();
        assert!(record.live);
        reporter.stop("test teardown").await.unwrap();
    }

    #[tokio::test]
    async fn stop_writes_final_row_with_reason() {
        let data: Arc<dyn DataStore> = Arc::new(InMemoryDatabase::new());
        let id = Uuid::new_v4();
        let mut reporter = InstanceReporter::new(data.clone(), id, vec![], serde_json::json!({}));
        reporter.start().await.unwrap();
        reporter.stop("SIGTERM").await.unwrap();

        let doc = data
            .find_one(INSTANCES, &Filter::new().eq("id", id.to_string()))
            .await
            .unwrap()
            .unwrap();
        let record: ServerInstanceRecord = serde_json::from_value(doc).unwrap();
        assert!(!record.live);
        assert_eq!(record.stop_reason.as_deref(), Some("SIGTERM"));
    }
}
