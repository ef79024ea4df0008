//! Prometheus metrics bootstrap.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Install the Prometheus recorder with its scrape listener. Call once at
/// boot, before any counters are touched.
pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus recorder")?;
    info!(port, "metrics exporter listening");
    initialize_counters();
    Ok(())
}

/// Touch every counter the service emits so dashboards show zeroes before
/// the first event instead of gaps.
pub fn initialize_counters() {
    metrics::counter!("processor.messages.total").absolute(0);
    metrics::counter!("processor.validation.failed").absolute(0);
    metrics::counter!("processor.persist.failed").absolute(0);
    metrics::counter!("processor.persist.duplicate").absolute(0);
    metrics::counter!("bus.publish.serialize_failed").absolute(0);
    metrics::counter!("hfgcs.detected").absolute(0);
    metrics::counter!("vox.segments.closed").absolute(0);
    metrics::counter!("whisper.transcribed").absolute(0);
    metrics::counter!("whisper.failed").absolute(0);
    metrics::counter!("whisper.retries").absolute(0);
    metrics::counter!("audio.segment.persist_failed").absolute(0);
    metrics::counter!("audio.transcription.queue_full").absolute(0);
    metrics::counter!("airframes.parse_failed").absolute(0);
}
