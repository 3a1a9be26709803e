use std::time;

use async_trait::async_trait;
use reqwest::header;

use crate::error::SourceError;

/// Something that hands out one raw reading per call, as JSON text.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self) -> Result<String, SourceError>;
}

/// Polls the simulated sensor endpoint over HTTP.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(url: &str, request_timeout: time::Duration) -> Result<Self, SourceError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("iot-producer")
            .timeout(request_timeout)
            .build()
            .map_err(SourceError::ClientError)?;

        Ok(Self {
            client,
            url: url.to_owned(),
        })
    }
}

#[async_trait]
impl DataSource for HttpSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::StatusError(status));
        }

        Ok(response.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const READING: &str = r#"{"device_id":1,"humidity":0.0,"temperature":951.37,"timestamp":"2024-01-01T00:00:00.000001"}"#;

    #[tokio::test]
    async fn test_fetch_returns_body_verbatim() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/iot_data");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(READING);
            })
            .await;

        let source = HttpSource::new(&server.url("/iot_data"), time::Duration::from_secs(5))
            .expect("failed to build source");
        let body = source.fetch().await.expect("fetch failed");

        mock.assert_async().await;
        assert_eq!(body, READING);
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_success_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/iot_data");
                then.status(503).body("unavailable");
            })
            .await;

        let source = HttpSource::new(&server.url("/iot_data"), time::Duration::from_secs(5))
            .expect("failed to build source");

        match source.fetch().await {
            Err(SourceError::StatusError(status)) => assert_eq!(status.as_u16(), 503),
            other => panic!("expected a status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_reports_unreachable_source() {
        let source = HttpSource::new(
            "http://127.0.0.1:1/iot_data",
            time::Duration::from_millis(500),
        )
        .expect("failed to build source");

        assert!(matches!(
            source.fetch().await,
            Err(SourceError::RequestError(_))
        ));
    }
}
