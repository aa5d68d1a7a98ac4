use super::tasks::EndpointTasks;
use super::{Configuration, HttpBulkLoad, LoadSpec, LogLevel, Pipeline};
use crate::batcher::{BatchSink, BatcherConfig, LoadBatcher, DEFAULT_BATCH_SIZE};
use crate::client::{BackendClient, HttpClient};
use crate::error::{BootstrapError, ClientError};
use crate::models::{Matrix, TransformationResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const LOG_PROCESS: &str = "load.log";

/// Delivery results of one cycle
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub points_loaded: usize,
    pub failed_endpoints: Vec<String>,
}

/// Posts batches of points to a bulk endpoint
struct HttpBulkSink {
    client: Arc<HttpClient>,
    path: String,
}

#[async_trait]
impl BatchSink<TransformationResult> for HttpBulkSink {
    async fn authenticate(&self) -> Result<(), ClientError> {
        self.client.authenticate().await
    }

    async fn send_batch(&self, batch: &[TransformationResult]) -> Result<(), ClientError> {
        self.client.post_json(&self.path, batch).await
    }
}

fn log_matrix(configuration: &str, level: LogLevel, matrix: &Matrix) -> usize {
    let mut count = 0;
    for point in matrix.iter().flatten() {
        let messages = point.metadata.messages.join("; ");
        let code = point.metadata.message_code.as_deref().unwrap_or("-");
        match level {
            LogLevel::Debug => debug!(
                configuration = %configuration,
                metric = %point.name,
                time = %point.time,
                value = point.value,
                original_value = point.original_value,
                code = %code,
                messages = %messages,
                "Loaded point"
            ),
            LogLevel::Info => info!(
                configuration = %configuration,
                metric = %point.name,
                time = %point.time,
                value = point.value,
                original_value = point.original_value,
                code = %code,
                messages = %messages,
                "Loaded point"
            ),
            LogLevel::Warn => warn!(
                configuration = %configuration,
                metric = %point.name,
                time = %point.time,
                value = point.value,
                original_value = point.original_value,
                code = %code,
                messages = %messages,
                "Loaded point"
            ),
        }
        count += 1;
    }
    count
}

impl Pipeline {
    /// Deliver the matrix to every load destination, endpoints concurrently
    pub async fn load(
        self: &Arc<Self>,
        configuration: &Configuration,
        matrix: Arc<Matrix>,
    ) -> Result<LoadOutcome, BootstrapError> {
        let mut outcome = LoadOutcome::default();
        let points = matrix.iter().map(Vec::len).sum::<usize>();
        if points == 0 {
            debug!(configuration = %configuration.name, "Nothing to load");
            return Ok(outcome);
        }

        let mut groups: BTreeMap<String, Vec<LoadSpec>> = BTreeMap::new();
        for spec in &configuration.load {
            match spec {
                LoadSpec::Log(log) => {
                    outcome.points_loaded += log_matrix(&configuration.name, log.level, &matrix);
                    self.status.succeeded(LOG_PROCESS);
                }
                other => {
                    if let Some(endpoint) = other.endpoint() {
                        groups
                            .entry(endpoint.to_string())
                            .or_default()
                            .push(other.clone());
                    }
                }
            }
        }

        let mut tasks = EndpointTasks::new();
        for (endpoint, specs) in groups {
            let pipeline = Arc::clone(self);
            let matrix = Arc::clone(&matrix);
            let name = endpoint.clone();
            tasks.spawn(endpoint, async move {
                let _permit = Arc::clone(&pipeline.io_permits).acquire_owned().await.ok();
                pipeline.load_endpoint(&name, specs, &matrix).await
            });
        }

        let joined = tasks.join("load", &configuration.name).await?;
        for (endpoint, ok) in joined.finished {
            if ok {
                outcome.points_loaded += points;
            } else {
                outcome.failed_endpoints.push(endpoint);
            }
        }
        for endpoint in joined.lost {
            self.status.failed(&format!("load.{endpoint}"));
            outcome.failed_endpoints.push(endpoint);
        }

        outcome.failed_endpoints.sort();
        Ok(outcome)
    }

    /// All destinations of one endpoint; true when every one succeeded
    async fn load_endpoint(
        &self,
        endpoint: &str,
        specs: Vec<LoadSpec>,
        matrix: &Matrix,
    ) -> Result<bool, BootstrapError> {
        let process = format!("load.{endpoint}");

        if self.shutdown.is_shutting_down() {
            return Ok(false);
        }

        if self.http.registry().find_connector(endpoint).is_none() {
            warn!(endpoint = %endpoint, "No connector for load endpoint, skipping");
            self.status.failed(&process);
            return Ok(false);
        }

        let pair = self.http.get_client(endpoint)?;
        let mut authenticated = false;
        let mut success = true;

        for spec in specs {
            match spec {
                LoadSpec::HttpWebhook(webhook) => {
                    if self.shutdown.is_shutting_down() {
                        return Ok(false);
                    }
                    if !authenticated {
                        if let Err(e) = pair.client.authenticate().await {
                            self.meter_failure(&process, &e);
                            warn!(endpoint = %endpoint, error = %e, "Authentication failed, skipping endpoint");
                            return Ok(false);
                        }
                        authenticated = true;
                    }

                    let start = Instant::now();
                    let posted = pair.client.post_json(&webhook.path, matrix).await;
                    self.status.record_latency(&process, start.elapsed());

                    match posted {
                        Ok(()) => self.status.succeeded(&process),
                        Err(e) => {
                            self.meter_failure(&process, &e);
                            warn!(endpoint = %endpoint, path = %webhook.path, error = %e, "Webhook load failed");
                            success = false;
                        }
                    }
                }
                LoadSpec::HttpBulk(bulk) => {
                    let batcher = self.bulk_batcher(endpoint, &bulk, &pair.client);
                    batcher.enqueue(matrix.iter().flatten().cloned());
                    success &= batcher.run().await.is_success();
                }
                LoadSpec::Log(_) => {}
            }
        }

        Ok(success)
    }

    /// Batcher for one bulk destination, created and started on first use
    fn bulk_batcher(
        &self,
        endpoint: &str,
        spec: &HttpBulkLoad,
        client: &Arc<HttpClient>,
    ) -> Arc<LoadBatcher<TransformationResult>> {
        let key = format!("{endpoint}:{}", spec.path);
        let mut created = false;

        let batcher = self
            .batchers
            .entry(key)
            .or_insert_with(|| {
                created = true;
                let sink = Arc::new(HttpBulkSink {
                    client: Arc::clone(client),
                    path: spec.path.clone(),
                });
                Arc::new(LoadBatcher::new(
                    format!("load.{endpoint}"),
                    BatcherConfig {
                        batch_size: spec.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                        flush_interval: self.bulk_flush_interval,
                    },
                    sink,
                    Arc::clone(&self.status),
                    self.shutdown.clone(),
                ))
            })
            .clone();

        if created {
            debug!(endpoint = %endpoint, path = %spec.path, "Started bulk load batcher");
            tokio::spawn(Arc::clone(&batcher).run_periodically());
        }
        batcher
    }
}
