use super::sink::{local_hostname, BatchEnvelope, Result, Sink, SinkError, SinkResponse};
use crate::pipeline::batch::Batch;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;

/// POSTs each batch as a JSON envelope.
#[derive(Debug)]
pub struct HttpSink {
    url: String,
    host: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration, headers: &HashMap<String, String>) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SinkError::InvalidUri(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SinkError::InvalidUri(format!("header {}: {}", name, e)))?;
            default_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            url: url.to_string(),
            host: local_hostname(),
            client,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn send(&self, batch: &Batch) -> Result<SinkResponse> {
        let envelope = BatchEnvelope::new(batch, &self.host);
        let response = self.client.post(&self.url).json(&envelope).send().await?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(SinkResponse::with_status(status));
        }

        Ok(SinkResponse {
            status,
            message: Some(response.text().await.unwrap_or_default()),
        })
    }
}
