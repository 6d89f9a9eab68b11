//! HTTP transport for the renewal link.

use url::Url;

use super::{ApiRequest, ApiResponse, RENEW_PATH, Transport, TransportError};

/// Real transport: reqwest with a cookie jar, so the HTTP-only refresh
/// cookie set by login and renewal rides along on the renewal call without
/// ever being visible to calling code.
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: Url) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(Self { http, base })
    }
}

impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let url = self
            .base
            .join(&request.path)
            .map_err(|e| TransportError(e.to_string()))?;

        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(bearer) = bearer {
            builder = builder.bearer_auth(bearer);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_default();

        Ok(ApiResponse { status, body })
    }

    async fn renew(&self) -> Result<Option<String>, TransportError> {
        let url = self
            .base
            .join(RENEW_PATH)
            .map_err(|e| TransportError(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        // Store outages and other server errors are renewal failures, not
        // "no renewal"; only a successful null answer means the session ended.
        if !response.status().is_success() {
            return Err(TransportError(format!(
                "renewal failed with status {}",
                response.status()
            )));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_default();

        Ok(body
            .get("accessToken")
            .and_then(|v| v.as_str())
            .map(String::from))
    }
}
