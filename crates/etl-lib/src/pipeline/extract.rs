use super::tasks::EndpointTasks;
use super::{CachedResponse, Configuration, ExtractSpec, HttpJsonExtract, Pipeline, StaticExtract};
use crate::client::{BackendClient, FetchOutcome, HttpClient};
use crate::error::{BootstrapError, ClientError};
use crate::models::{Matrix, SeriesDocument};
use crate::polling::{poll_until_ready, PollState};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STATIC_PROCESS: &str = "extract.static";

/// Merged extract results of one cycle
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    /// Series in declared extract order
    pub matrix: Matrix,
    pub failed_endpoints: Vec<String>,
}

impl ExtractOutcome {
    pub fn points(&self) -> usize {
        self.matrix.iter().map(Vec::len).sum()
    }
}

/// What one endpoint contributed, tagged with each source's declared index
struct EndpointExtract {
    endpoint: String,
    outputs: Vec<(usize, Matrix)>,
    success: bool,
}

impl EndpointExtract {
    fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            outputs: Vec::new(),
            success: true,
        }
    }

    fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Stable cache key for one request
pub(crate) fn request_key(endpoint: &str, path: &str, query: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    for (k, v) in query {
        hasher.update(b"\n");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn into_matrix(documents: Vec<SeriesDocument>) -> Matrix {
    documents
        .into_iter()
        .map(SeriesDocument::into_series)
        .filter(|s| !s.is_empty())
        .collect()
}

impl Pipeline {
    /// Run every extract source, endpoints concurrently
    pub async fn extract(
        self: &Arc<Self>,
        configuration: &Configuration,
    ) -> Result<ExtractOutcome, BootstrapError> {
        let mut groups: BTreeMap<String, Vec<(usize, HttpJsonExtract)>> = BTreeMap::new();
        let mut outputs: Vec<(usize, Matrix)> = Vec::new();

        for (index, spec) in configuration.extract.iter().enumerate() {
            match spec {
                ExtractSpec::HttpJson(http) => groups
                    .entry(http.endpoint.clone())
                    .or_default()
                    .push((index, http.clone())),
                ExtractSpec::Static(fixed) => outputs.push((index, self.extract_static(fixed))),
            }
        }

        let mut tasks = EndpointTasks::new();
        for (endpoint, specs) in groups {
            let pipeline = Arc::clone(self);
            let name = endpoint.clone();
            tasks.spawn(endpoint, async move {
                let _permit = Arc::clone(&pipeline.io_permits).acquire_owned().await.ok();
                pipeline.extract_endpoint(&name, specs).await
            });
        }

        let joined = tasks.join("extract", &configuration.name).await?;
        let mut failed_endpoints = Vec::new();
        for (_, result) in joined.finished {
            if !result.success {
                failed_endpoints.push(result.endpoint);
            }
            outputs.extend(result.outputs);
        }
        for endpoint in joined.lost {
            self.status.failed(&format!("extract.{endpoint}"));
            failed_endpoints.push(endpoint);
        }

        outputs.sort_by_key(|(index, _)| *index);
        failed_endpoints.sort();

        Ok(ExtractOutcome {
            matrix: outputs.into_iter().flat_map(|(_, m)| m).collect(),
            failed_endpoints,
        })
    }

    fn extract_static(&self, fixed: &StaticExtract) -> Matrix {
        let matrix = into_matrix(fixed.series.clone());
        if matrix.is_empty() {
            self.status.no_data(STATIC_PROCESS);
        } else {
            self.status.succeeded(STATIC_PROCESS);
        }
        matrix
    }

    /// All sources of one endpoint, sharing one client and one authentication
    async fn extract_endpoint(
        &self,
        endpoint: &str,
        specs: Vec<(usize, HttpJsonExtract)>,
    ) -> Result<EndpointExtract, BootstrapError> {
        let process = format!("extract.{endpoint}");
        let mut result = EndpointExtract::new(endpoint);

        if self.shutdown.is_shutting_down() {
            return Ok(result.failed());
        }

        if self.http.registry().find_connector(endpoint).is_none() {
            warn!(endpoint = %endpoint, "No connector for extract endpoint, skipping");
            self.status.failed(&process);
            return Ok(result.failed());
        }

        let pair = self.http.get_client(endpoint)?;
        let mut authenticated = false;

        for (index, spec) in specs {
            let key = request_key(endpoint, &spec.path, &spec.query);

            if spec.cache_ttl_millis.is_some() {
                if let Some(hit) = pair.cache.is_cached(&key) {
                    debug!(endpoint = %endpoint, path = %spec.path, "Extract served from cache");
                    self.status.succeeded(&process);
                    result.outputs.push((index, hit.matrix.clone()));
                    continue;
                }
            }

            if self.shutdown.is_shutting_down() {
                result.success = false;
                break;
            }

            if !authenticated {
                if let Err(e) = pair.client.authenticate().await {
                    self.meter_failure(&process, &e);
                    warn!(endpoint = %endpoint, error = %e, "Authentication failed, skipping endpoint");
                    result.success = false;
                    break;
                }
                authenticated = true;
            }

            let start = Instant::now();
            let fetched = self.fetch(&pair.client, &spec).await;
            self.status.record_latency(&process, start.elapsed());

            match fetched {
                Ok(matrix) if matrix.is_empty() => {
                    debug!(endpoint = %endpoint, path = %spec.path, "Extract returned no data");
                    self.status.no_data(&process);
                }
                Ok(matrix) => {
                    self.status.succeeded(&process);
                    if let Some(ttl) = spec.cache_ttl_millis {
                        pair.cache.cache(
                            CachedResponse::new(key, matrix.clone()),
                            Duration::from_millis(ttl),
                        );
                    }
                    result.outputs.push((index, matrix));
                }
                Err(e) => {
                    self.meter_failure(&process, &e);
                    warn!(endpoint = %endpoint, path = %spec.path, error = %e, "Extract failed");
                    result.success = false;
                    if e.is_unauthorized() || matches!(e, ClientError::ShuttingDown) {
                        break;
                    }
                }
            }
        }

        Ok(result)
    }

    async fn fetch(&self, client: &HttpClient, spec: &HttpJsonExtract) -> Result<Matrix, ClientError> {
        let documents = match spec.polling {
            Some(polling) => {
                poll_until_ready(polling, &self.shutdown, move || async move {
                    client
                        .fetch_series(&spec.path, &spec.query)
                        .await
                        .map(|outcome| match outcome {
                            FetchOutcome::Ready(documents) => PollState::Ready(documents),
                            FetchOutcome::Pending => PollState::Pending,
                        })
                })
                .await?
            }
            None => match client.fetch_series(&spec.path, &spec.query).await? {
                FetchOutcome::Ready(documents) => documents,
                FetchOutcome::Pending => {
                    debug!(path = %spec.path, "Report not ready and polling disabled");
                    Vec::new()
                }
            },
        };
        Ok(into_matrix(documents))
    }

    pub(super) fn meter_failure(&self, process: &str, error: &ClientError) {
        match error {
            ClientError::Unauthorized(_) => self.status.authentication_failure(process),
            ClientError::ShuttingDown => {}
            _ => self.status.failed(process),
        }
    }
}
