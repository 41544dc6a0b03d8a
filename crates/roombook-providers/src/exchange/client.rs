//! HTTP transport for Exchange: SOAP POSTs to EWS and plain GETs for ICS
//! feeds, with Basic/Digest negotiation on 401.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use url::{Position, Url};

use crate::error::{UpstreamError, UpstreamResult};

use super::auth::{Challenge, basic_auth};
use super::config::ExchangeConfig;
use super::ews::parse_soap_fault;

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Shared HTTP client. Safe to use from many tasks at once.
pub struct ExchangeClient {
    client: Client,
    config: ExchangeConfig,
    /// Scheme learned from the last 401, reused preemptively.
    challenge: Mutex<Option<Challenge>>,
}

impl ExchangeClient {
    pub fn new(config: ExchangeConfig) -> UpstreamResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                UpstreamError::unavailable(format!("failed to create HTTP client: {e}"))
                    .with_source(e)
            })?;

        Ok(Self {
            client,
            config,
            challenge: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// POSTs a SOAP envelope and returns the response body.
    pub async fn post_soap(&self, url: &Url, envelope: String) -> UpstreamResult<String> {
        self.request(Method::POST, url, Some(envelope)).await
    }

    /// GETs a document, typically an ICS feed.
    pub async fn get(&self, url: &Url) -> UpstreamResult<String> {
        self.request(Method::GET, url, None).await
    }

    async fn request(
        &self,
        method: Method,
        url: &Url,
        body: Option<String>,
    ) -> UpstreamResult<String> {
        let soap = body.is_some();
        let response = self.send(method.clone(), url, body.clone()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::read_body(response, soap).await;
        }

        let challenge = Challenge::select(
            response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let Some(challenge) = challenge else {
            return Err(UpstreamError::auth(
                "server requires an authentication scheme other than Basic or Digest",
            ));
        };
        if self.config.credentials().is_none() {
            return Err(UpstreamError::auth(
                "server requires authentication but no credentials are configured",
            ));
        }

        debug!(url = %url, "received 401, retrying with credentials");
        *self.challenge.lock().await = Some(challenge);
        let response = self.send(method, url, body).await?;
        Self::read_body(response, soap).await
    }

    async fn send(&self, method: Method, url: &Url, body: Option<String>) -> UpstreamResult<Response> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, SOAP_CONTENT_TYPE).body(body);
        }
        request = self.authorize(request, &method, url).await;

        trace!(method = %method, url = %url, "sending request");
        Ok(request.send().await?)
    }

    async fn authorize(&self, request: RequestBuilder, method: &Method, url: &Url) -> RequestBuilder {
        let Some((username, password)) = self.config.credentials() else {
            return request;
        };
        let mut challenge = self.challenge.lock().await;
        let header = match challenge.as_mut() {
            Some(Challenge::Digest(digest)) => {
                digest.authorize(method.as_str(), request_uri(url), username, password)
            }
            Some(Challenge::Basic) => basic_auth(username, password),
            None => return request,
        };
        request.header(AUTHORIZATION, header)
    }

    /// EWS reports most failures as a SOAP fault inside a 500, so for
    /// `soap` requests the fault decides the error before the status does.
    async fn read_body(response: Response, soap: bool) -> UpstreamResult<String> {
        let status = response.status();
        trace!(status = %status, "received response");

        if status.is_success() {
            return Ok(response.text().await?);
        }
        let body = response.text().await.unwrap_or_default();
        if soap && let Some(fault) = parse_soap_fault(&body) {
            debug!(status = %status, "upstream answered with a SOAP fault");
            return Err(fault.with_payload(&body));
        }
        Err(error_for_status(status, &body))
    }
}

/// Digest `uri`: the request target, path plus query.
fn request_uri(url: &Url) -> &str {
    &url[Position::BeforePath..Position::AfterQuery]
}

/// Maps a non-success status onto the upstream error taxonomy.
fn error_for_status(status: StatusCode, body: &str) -> UpstreamError {
    let error = match status {
        StatusCode::UNAUTHORIZED => UpstreamError::auth("credentials rejected"),
        StatusCode::FORBIDDEN => UpstreamError::auth("access to the calendar denied"),
        StatusCode::NOT_FOUND | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            UpstreamError::unavailable(format!("upstream answered {status}"))
        }
        s if s.is_server_error() => UpstreamError::unavailable(format!("upstream server error {s}")),
        s => {
            warn!(status = %s, "unexpected upstream status");
            UpstreamError::malformed(format!("unexpected status {s}"))
        }
    };
    error.with_payload(body)
}
