use crate::ingest::Ingestor;
use crate::metrics::INGEST_FAILURES_TOTAL;
use crate::model::Event;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Drains the event channel, ingesting strictly in arrival order.
///
/// A failed event is logged and counted, then the consumer moves on. Returns
/// once every sender is dropped and the channel is empty.
pub async fn run_consumer(mut rx: mpsc::Receiver<Event>, ingestor: Arc<Ingestor>) {
    info!("Starting event consumer");

    let mut ingested: u64 = 0;
    while let Some(event) = rx.recv().await {
        match ingestor.ingest(&event).await {
            Ok(_) => ingested += 1,
            Err(e) => {
                INGEST_FAILURES_TOTAL.inc();
                error!(
                    "Failed to ingest {} event for {}: {}",
                    event.event_type.as_str(),
                    event.mower_id.as_deref().unwrap_or("-"),
                    e
                );
            }
        }
    }

    info!("Event consumer stopped after {} events", ingested);
}
