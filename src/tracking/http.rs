use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;

use super::{encode_png, sha256_hex, ExperimentTracker, LogRecord};

/// Posts each logged image as JSON to `<endpoint>/log`
pub struct HttpTracker {
    endpoint: String,
    api_key: Option<String>,
    run: String,
    steps: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
struct LogRequest<'a> {
    #[serde(flatten)]
    record: LogRecord<'a>,
    media_type: &'static str,
    image_base64: String,
}

impl HttpTracker {
    pub fn new(endpoint: &str, api_key: Option<&str>, run: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.map(|k| k.to_string()),
            run: run.to_string(),
            steps: HashMap::new(),
        }
    }

    fn log_url(&self) -> String {
        format!("{}/log", self.endpoint)
    }
}

impl ExperimentTracker for HttpTracker {
    fn log_image(&mut self, key: &str, image: &RgbImage) -> Result<()> {
        let step = self.steps.entry(key.to_string()).or_insert(0);
        let current = *step;
        *step += 1;

        let png = encode_png(image)?;
        let request = LogRequest {
            record: LogRecord {
                run: &self.run,
                step: current,
                key,
                sha256: sha256_hex(&png),
                timestamp: chrono::Local::now(),
            },
            media_type: "image/png",
            image_base64: BASE64.encode(&png),
        };

        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(60))
            .build();

        let url = self.log_url();
        let mut req = agent.post(&url).set("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        req.send_json(&request)
            .map_err(|e| anyhow!("Tracking request to {} failed: {}", url, e))?;

        tracing::info!(key = %key, step = current, endpoint = %self.endpoint, "Logged image");
        Ok(())
    }

    fn run_name(&self) -> &str {
        &self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_url() {
        let tracker = HttpTracker::new("http://127.0.0.1:8080/api/", None, "run");
        assert_eq!(tracker.log_url(), "http://127.0.0.1:8080/api/log");
        assert_eq!(tracker.run_name(), "run");
    }

    #[test]
    fn test_request_shape() {
        let request = LogRequest {
            record: LogRecord {
                run: "run",
                step: 2,
                key: "t-SNE",
                sha256: "00".to_string(),
                timestamp: chrono::Local::now(),
            },
            media_type: "image/png",
            image_base64: BASE64.encode(b"png"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["key"], "t-SNE");
        assert_eq!(json["step"], 2);
        assert_eq!(json["image_base64"], "cG5n");
        assert!(json.get("record").is_none());
    }

    #[test]
    fn test_unreachable_endpoint_fails() {
        let mut tracker = HttpTracker::new("http://127.0.0.1:9", None, "run");
        let image = RgbImage::new(2, 2);
        assert!(tracker.log_image("t-SNE", &image).is_err());
    }
}
