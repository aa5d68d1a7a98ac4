use crate::error::BootstrapError;
use std::collections::BTreeSet;
use std::future::Future;
use tokio::task::JoinSet;
use tracing::error;

/// Concurrent per-endpoint tasks of one pipeline stage
///
/// Tracks which endpoints are still outstanding so a task that panics or is
/// aborted is still attributed to its endpoint.
pub(crate) struct EndpointTasks<T> {
    tasks: JoinSet<Result<(String, T), BootstrapError>>,
    pending: BTreeSet<String>,
}

/// Results of finished tasks plus the endpoints whose task died
pub(crate) struct Joined<T> {
    pub finished: Vec<(String, T)>,
    pub lost: Vec<String>,
}

impl<T: Send + 'static> EndpointTasks<T> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            pending: BTreeSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, endpoint: String, work: F)
    where
        F: Future<Output = Result<T, BootstrapError>> + Send + 'static,
    {
        self.pending.insert(endpoint.clone());
        self.tasks
            .spawn(async move { work.await.map(|value| (endpoint, value)) });
    }

    /// Wait for every task
    ///
    /// The first bootstrap error is returned immediately and the remaining
    /// tasks are aborted.
    pub async fn join(mut self, stage: &str, configuration: &str) -> Result<Joined<T>, BootstrapError> {
        let mut finished = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok((endpoint, value))) => {
                    self.pending.remove(&endpoint);
                    finished.push((endpoint, value));
                }
                Ok(Err(bootstrap)) => return Err(bootstrap),
                Err(e) => error!(
                    configuration = %configuration,
                    stage = %stage,
                    error = %e,
                    "Endpoint task aborted"
                ),
            }
        }

        Ok(Joined {
            finished,
            lost: self.pending.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicked_task_is_reported_lost() {
        let mut tasks = EndpointTasks::new();
        tasks.spawn("healthy".to_string(), async { Ok(1) });
        tasks.spawn("broken".to_string(), async {
            if true {
                panic!("decoder blew up");
            }
            Ok(2)
        });

        let joined = tasks.join("extract", "cpu").await.unwrap();
        assert_eq!(joined.finished, vec![("healthy".to_string(), 1)]);
        assert_eq!(joined.lost, vec!["broken".to_string()]);
    }

    #[tokio::test]
    async fn test_all_finished_leaves_nothing_lost() {
        let mut tasks = EndpointTasks::new();
        for endpoint in ["a", "b", "c"] {
            tasks.spawn(endpoint.to_string(), async move { Ok(endpoint.len()) });
        }

        let joined = tasks.join("load", "cpu").await.unwrap();
        assert_eq!(joined.finished.len(), 3);
        assert!(joined.lost.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_error_propagates() {
        let mut tasks: EndpointTasks<()> = EndpointTasks::new();
        tasks.spawn("prom".to_string(), async {
            Err(BootstrapError::UnknownEndpoint("prom".to_string()))
        });

        let err = tasks.join("extract", "cpu").await.err().unwrap();
        assert!(matches!(err, BootstrapError::UnknownEndpoint(_)));
    }
}
