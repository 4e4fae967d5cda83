//! External transaction-extraction service.
//!
//! Best-effort: results are stored alongside the record but never replace
//! the local parse, and failures only leave the record unenriched.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EnrichmentError;
use crate::pipeline::types::TransactionVariables;

/// Normalized variables plus a type classification.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResult {
    #[serde(default)]
    pub transaction_variables: Option<TransactionVariables>,
    #[serde(default)]
    pub transaction_type: Option<String>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, html: &str) -> Result<EnrichmentResult, EnrichmentError>;
}

/// `POST {url}` with `{"html": ...}`.
pub struct HttpEnricher {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpEnricher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichmentError::Request(format!("client init: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, html: &str) -> Result<EnrichmentResult, EnrichmentError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "html": html }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout(self.timeout)
                } else {
                    EnrichmentError::Request(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(EnrichmentError::Status(resp.status().as_u16()));
        }

        resp.json::<EnrichmentResult>()
            .await
            .map_err(|e| EnrichmentError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::{Value, json};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn parses_variables_and_type() {
        let app = Router::new().route(
            "/extract",
            post(|Json(body): Json<Value>| async move {
                assert!(body["html"].as_str().unwrap().contains("S/ 50.00"));
                Json(json!({
                    "transactionVariables": {
                        "originAccount": "191-123",
                        "amount": 50.0,
                        "currency": "PEN",
                        "operationNumber": "778899"
                    },
                    "transactionType": "transfer"
                }))
            }),
        );
        let base = serve(app).await;
        let enricher =
            HttpEnricher::new(format!("{base}/extract"), Duration::from_secs(5)).unwrap();

        let result = enricher.enrich("<p>Monto S/ 50.00</p>").await.unwrap();
        let vars = result.transaction_variables.unwrap();
        assert_eq!(vars.origin_account.as_deref(), Some("191-123"));
        assert_eq!(vars.amount.as_deref(), Some("50.0"));
        assert_eq!(result.transaction_type.as_deref(), Some("transfer"));
    }

    #[tokio::test]
    async fn server_error_is_status() {
        let app = Router::new().route(
            "/extract",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
        let base = serve(app).await;
        let enricher =
            HttpEnricher::new(format!("{base}/extract"), Duration::from_secs(5)).unwrap();
        let err = enricher.enrich("<p/>").await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Status(502)));
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let app = Router::new().route(
            "/extract",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({}))
            }),
        );
        let base = serve(app).await;
        let enricher =
            HttpEnricher::new(format!("{base}/extract"), Duration::from_millis(200)).unwrap();
        let err = enricher.enrich("<p/>").await.unwrap_err();
        assert!(matches!(err, EnrichmentError::Timeout(_)));
    }
}
