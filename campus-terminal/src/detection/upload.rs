//! Result delivery: the live link first, the HTTP endpoint as fallback

use crate::error::DetectionError;
use crate::transport::TelemetrySink;
use campus_protocol::{format_timestamp, Message, NodeReport};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRoute {
    Link,
    Http,
}

/// Body of the HTTP fallback upload
#[derive(Debug, Serialize)]
struct UploadBody<'a> {
    id: &'a str,
    detected_count: Option<u32>,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    co2_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

pub struct Uploader {
    link: Arc<dyn TelemetrySink>,
    http: reqwest::Client,
    api_url: String,
    timeout: Duration,
}

impl Uploader {
    pub fn new(link: Arc<dyn TelemetrySink>, api_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            link,
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            timeout,
        }
    }

    pub fn link(&self) -> &Arc<dyn TelemetrySink> {
        &self.link
    }

    pub async fn upload(&self, report: &NodeReport) -> Result<UploadRoute, DetectionError> {
        if self.link.is_connected() && self.link.send(Message::nodes_data(vec![report.clone()])).await {
            return Ok(UploadRoute::Link);
        }
        debug!(node = %report.id, "Link unavailable, uploading over HTTP");
        self.post(report).await.map(|()| UploadRoute::Http)
    }

    async fn post(&self, report: &NodeReport) -> Result<(), DetectionError> {
        if self.api_url.is_empty() {
            return Err(DetectionError::Upload("no api_url configured".into()));
        }
        let body = UploadBody {
            id: report.id.as_str(),
            detected_count: report.detected_count,
            timestamp: format_timestamp(Utc::now()),
            temperature: report.temperature,
            humidity: report.humidity,
            co2_level: report.co2_level,
            error: report.error.as_deref(),
        };

        let response = self
            .http
            .post(&self.api_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| DetectionError::Upload(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            warn!(node = %report.id, status = response.status().as_u16(), "HTTP upload rejected");
            Err(DetectionError::Upload(format!("HTTP {}", response.status())))
        }
    }
}
