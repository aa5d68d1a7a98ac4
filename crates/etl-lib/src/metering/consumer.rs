use super::{StatusLevel, StatusMessage};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Receives the status report produced by each metering cycle
#[async_trait]
pub trait StatusConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn accept(&self, messages: &[StatusMessage]) -> anyhow::Result<()>;
}

/// Writes status messages to the structured log
pub struct LogStatusConsumer;

#[async_trait]
impl StatusConsumer for LogStatusConsumer {
    fn name(&self) -> &str {
        "log"
    }

    async fn accept(&self, messages: &[StatusMessage]) -> anyhow::Result<()> {
        for m in messages {
            match m.level {
                StatusLevel::Crit => error!(
                    event = "status_message",
                    level = %m.level,
                    meter = %m.meter,
                    value = m.value,
                    "{}", m.text
                ),
                StatusLevel::Warn => warn!(
                    event = "status_message",
                    level = %m.level,
                    meter = %m.meter,
                    value = m.value,
                    "{}", m.text
                ),
                StatusLevel::Ok => info!(
                    event = "status_message",
                    level = %m.level,
                    meter = %m.meter,
                    value = m.value,
                    "{}", m.text
                ),
            }
        }
        Ok(())
    }
}
