//! HTTP health probes.

use std::time::Duration;

use serde::Serialize;

/// Result of probing a health-check URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Why the probe failed, for alerts. `None` when healthy.
    pub fn failure_reason(&self) -> Option<String> {
        if self.ok {
            return None;
        }
        Some(match (&self.error, self.status) {
            (Some(error), _) => error.clone(),
            (None, Some(status)) => format!("endpoint answered with status {}", status),
            (None, None) => "endpoint did not respond".to_string(),
        })
    }

    pub fn alert_text(&self, app: &str) -> String {
        format!(
            "HEALTH CHECK ALERT\nApp: {}\nURL: {}\nReason: {}",
            app,
            self.url,
            self.failure_reason().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// GET `url`; healthy means a 2xx answer within the timeout.
    pub async fn check(&self, url: &str) -> HealthReport {
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                HealthReport {
                    ok: status.is_success(),
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    error: None,
                }
            }
            Err(e) => HealthReport {
                ok: false,
                url: url.to_string(),
                status: None,
                error: Some(if e.is_timeout() {
                    format!("timed out after {}s", self.timeout.as_secs())
                } else {
                    e.to_string()
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_2xx_is_healthy() {
        let base = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let report = HealthProbe::new(Duration::from_secs(5))
            .check(&format!("{}/health", base))
            .await;
        assert!(report.ok);
        assert_eq!(report.status, Some(200));
        assert!(report.failure_reason().is_none());
    }

    #[tokio::test]
    async fn test_5xx_is_unhealthy() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let report = HealthProbe::new(Duration::from_secs(5))
            .check(&format!("{}/health", base))
            .await;
        assert!(!report.ok);
        assert_eq!(
            report.failure_reason().unwrap(),
            "endpoint answered with status 503"
        );
        assert!(report.alert_text("api").contains("App: api"));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let report = HealthProbe::new(Duration::from_millis(200))
            .check(&format!("{}/health", base))
            .await;
        assert!(!report.ok);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unhealthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let report = HealthProbe::new(Duration::from_secs(2))
            .check(&format!("http://{}/", addr))
            .await;
        assert!(!report.ok);
        assert!(report.status.is_none());
    }
}
