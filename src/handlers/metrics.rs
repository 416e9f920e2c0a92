use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics were not UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FLAGS_INSERTED;

    #[tokio::test]
    async fn exposes_crate_metrics() {
        FLAGS_INSERTED.inc_by(0.0);
        let body = metrics_handler().await.unwrap();
        assert!(body.contains("hoverflag_flags_inserted_total"));
    }
}
