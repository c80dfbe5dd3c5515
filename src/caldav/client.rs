// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use fast_dav_rs::{CalDavClient, CalendarInfo, SyncResponse};
use hyper::{Method, StatusCode};
use rand::Rng;
use tokio::net::lookup_host;
use tracing::warn;
use url::Url;

use crate::error::CalBridgeError;
use crate::models::CaldavEndpoint;

const MAX_REDIRECTS: u8 = 3;
const MAX_RETRY_JITTER: Duration = Duration::from_secs(2);

/// Outcome of fetching a single event.
#[derive(Debug)]
pub struct FetchedEvent {
    pub ical_body: String,
    pub etag: Option<String>,
}

/// Outcome of a successful PUT.
#[derive(Debug)]
pub struct PutOutcome {
    pub etag: Option<String>,
}

/// Guards a `fast_dav_rs::CalDavClient` with the protocol behaviors spec.md
/// §4.1 requires that the base client doesn't provide: scheme/host
/// validation at construction, bounded manual redirects, and a single
/// jittered retry on transient failures.
pub struct GuardedClient {
    inner: CalDavClient,
}

impl GuardedClient {
    /// Validates the endpoint before building the underlying client:
    /// HTTPS-only outside development, and private/loopback addresses are
    /// rejected unless explicitly allowed.
    pub async fn new(
        endpoint: &CaldavEndpoint,
        allow_https_only: bool,
        allow_private_networks: bool,
    ) -> Result<Self, CalBridgeError> {
        validate_endpoint_url(&endpoint.url, allow_https_only, allow_private_networks).await?;

        let inner = CalDavClient::new(
            &endpoint.url,
            Some(endpoint.username.as_str()),
            Some(endpoint.password.as_str()),
        )
        .map_err(|e| CalBridgeError::Config(format!("invalid CalDAV endpoint: {e}")))?;

        Ok(Self { inner })
    }

    pub async fn discover_current_user_principal(&self) -> Result<Option<String>, CalBridgeError> {
        self.with_retry(|| async { self.inner.discover_current_user_principal().await })
            .await
            .map_err(map_discovery_error)
    }

    pub async fn discover_calendar_home_set(
        &self,
        principal_path: &str,
    ) -> Result<Vec<String>, CalBridgeError> {
        self.with_retry(|| async { self.inner.discover_calendar_home_set(principal_path).await })
            .await
            .map_err(map_discovery_error)
    }

    pub async fn list_calendars(
        &self,
        home_set_path: &str,
    ) -> Result<Vec<CalendarInfo>, CalBridgeError> {
        self.with_retry(|| async { self.inner.list_calendars(home_set_path).await })
            .await
            .map_err(map_discovery_error)
    }

    /// Incremental sync via `sync-collection`. Callers MUST fall back to
    /// `full_enumeration` on `CalBridgeError::Protocol` carrying a 507 or
    /// "invalid token" server response — see `is_invalid_sync_token`.
    pub async fn sync_collection(
        &self,
        calendar_href: &str,
        sync_token: Option<&str>,
    ) -> Result<SyncResponse, CalBridgeError> {
        self.with_retry(|| async {
            self.inner
                .sync_collection(calendar_href, sync_token, None, true)
                .await
        })
        .await
        .map_err(|e| {
            if is_invalid_sync_token_error(&e) {
                CalBridgeError::Protocol(format!("invalid sync token: {e}"))
            } else {
                map_discovery_error(e)
            }
        })
    }

    /// `PROPFIND Depth: 1` equivalent (via `calendar-query` with no time
    /// filter), requesting full object bodies so UIDs can be extracted
    /// without a second round-trip per event.
    pub async fn full_enumeration(
        &self,
        calendar_href: &str,
    ) -> Result<Vec<fast_dav_rs::CalendarObject>, CalBridgeError> {
        self.with_retry(|| async {
            self.inner
                .calendar_query_timerange(calendar_href, "VEVENT", None, None, true)
                .await
        })
        .await
        .map_err(map_discovery_error)
    }

    pub async fn fetch_event(&self, href: &str) -> Result<FetchedEvent, CalBridgeError> {
        let resp = self.request_with_redirects(Method::GET, href, None, None).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CalBridgeError::NotFound(href.to_string()));
        }
        if !status.is_success() {
            return Err(CalBridgeError::Network(format!(
                "GET {href} failed with {status}"
            )));
        }
        let etag = CalDavClient::etag_from_headers(resp.headers());
        let body = String::from_utf8_lossy(resp.body()).into_owned();
        Ok(FetchedEvent {
            ical_body: body,
            etag,
        })
    }

    /// `mode` selects the conditional-put discipline per spec.md §4.1.
    pub async fn put_event(
        &self,
        href: &str,
        ical_body: &str,
        mode: PutMode<'_>,
    ) -> Result<PutOutcome, CalBridgeError> {
        let header = match mode {
            PutMode::Create => Some(("if-none-match", "*".to_string())),
            PutMode::ConditionalUpdate(etag) => Some(("if-match", etag.to_string())),
            PutMode::Unconditional => None,
        };
        let resp = self
            .request_with_redirects(
                Method::PUT,
                href,
                header,
                Some(Bytes::from(ical_body.to_owned())),
            )
            .await?;
        let status = resp.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(CalBridgeError::Precondition(href.to_string()));
        }
        if !status.is_success() {
            return Err(CalBridgeError::Network(format!(
                "PUT {href} failed with {status}"
            )));
        }
        let etag = CalDavClient::etag_from_headers(resp.headers());
        Ok(PutOutcome { etag })
    }

    pub async fn delete_event(
        &self,
        href: &str,
        if_match: Option<&str>,
    ) -> Result<(), CalBridgeError> {
        let header = if_match.map(|e| ("if-match", e.to_string()));
        let resp = self
            .request_with_redirects(Method::DELETE, href, header, None)
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            // A delete of an already-gone resource is a success.
            return Ok(());
        }
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(CalBridgeError::Precondition(href.to_string()));
        }
        if !status.is_success() {
            return Err(CalBridgeError::Network(format!(
                "DELETE {href} failed with {status}"
            )));
        }
        Ok(())
    }

    async fn request_with_redirects(
        &self,
        method: Method,
        path: &str,
        conditional_header: Option<(&str, String)>,
        body: Option<Bytes>,
    ) -> Result<hyper::Response<Bytes>, CalBridgeError> {
        let mut current_path = path.to_string();
        for hop in 0..=MAX_REDIRECTS {
            let mut headers = hyper::HeaderMap::new();
            if let Some((name, value)) = &conditional_header {
                let header_name: hyper::header::HeaderName = (*name).parse().map_err(|_| {
                    CalBridgeError::Protocol("invalid conditional header name".to_string())
                })?;
                let header_value = hyper::header::HeaderValue::from_str(value).map_err(|_| {
                    CalBridgeError::Precondition("invalid etag header value".to_string())
                })?;
                headers.insert(header_name, header_value);
            }

            let result = self
                .with_retry(|| async {
                    self.inner
                        .send(method.clone(), &current_path, headers.clone(), body.clone(), None)
                        .await
                })
                .await
                .map_err(map_discovery_error)?;

            if result.status().is_redirection() {
                if hop == MAX_REDIRECTS {
                    return Err(CalBridgeError::Protocol(
                        "too many redirects".to_string(),
                    ));
                }
                if let Some(location) = result
                    .headers()
                    .get(hyper::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    current_path = location.to_string();
                    continue;
                }
                return Err(CalBridgeError::Protocol(
                    "redirect response missing Location header".to_string(),
                ));
            }

            return Ok(result);
        }
        unreachable!("loop always returns or errors before exhausting MAX_REDIRECTS + 1 hops")
    }

    /// At-most-one retry with jitter on connection reset, 5xx (except 501),
    /// and 429. This is the protocol layer's full retry budget; the
    /// Reconciler's next pass is the real recovery mechanism.
    async fn with_retry<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        match f().await {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, "transient CalDAV request failure, retrying once");
                let jitter = Duration::from_millis(
                    rand::thread_rng().gen_range(0..MAX_RETRY_JITTER.as_millis() as u64),
                );
                tokio::time::sleep(jitter).await;
                f().await
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PutMode<'a> {
    Create,
    ConditionalUpdate(&'a str),
    Unconditional,
}

fn map_discovery_error(e: anyhow::Error) -> CalBridgeError {
    CalBridgeError::Network(e.to_string())
}

/// `507 Insufficient Storage` or the rare server reporting the sync token as
/// invalid; either way the caller MUST fall back to full enumeration.
pub fn is_invalid_sync_token_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("507") || msg.contains("invalid token") || msg.contains("invalid sync token")
}

/// Public wrapper so the Reconciler can branch on the error it receives from
/// `sync_collection` without re-stringifying it.
pub fn is_invalid_sync_token(err: &CalBridgeError) -> bool {
    matches!(err, CalBridgeError::Protocol(msg) if msg.to_lowercase().contains("invalid sync token"))
}

async fn validate_endpoint_url(
    raw_url: &str,
    allow_https_only: bool,
    allow_private_networks: bool,
) -> Result<(), CalBridgeError> {
    let url = Url::parse(raw_url)
        .map_err(|e| CalBridgeError::Config(format!("invalid CalDAV URL {raw_url}: {e}")))?;

    if allow_https_only && url.scheme() != "https" {
        return Err(CalBridgeError::Config(format!(
            "CalDAV URL {raw_url} must use https in production"
        )));
    }

    if allow_private_networks {
        return Ok(());
    }

    let host = url
        .host_str()
        .ok_or_else(|| CalBridgeError::Config(format!("CalDAV URL {raw_url} has no host")))?;
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| CalBridgeError::Network(format!("DNS resolution failed for {host}: {e}")))?;

    for addr in addrs {
        if is_disallowed(addr.ip()) {
            return Err(CalBridgeError::Config(format!(
                "CalDAV URL {raw_url} resolves to a private/loopback address"
            )));
        }
    }

    Ok(())
}

fn is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_http_in_production() {
        let err = validate_endpoint_url("http://example.com/dav/", true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CalBridgeError::Config(_)));
    }

    #[tokio::test]
    async fn allows_http_in_development() {
        // example.com resolves to a public address; scheme check is skipped.
        let result = validate_endpoint_url("http://example.com/dav/", false, true).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_loopback_host() {
        let err = validate_endpoint_url("https://127.0.0.1/dav/", true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CalBridgeError::Config(_)));
    }

    #[tokio::test]
    async fn allows_loopback_when_explicitly_enabled() {
        let result = validate_endpoint_url("https://127.0.0.1/dav/", true, true).await;
        assert!(result.is_ok());
    }

    #[test]
    fn disallows_known_private_ranges() {
        assert!(is_disallowed("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed("10.0.0.5".parse().unwrap()));
        assert!(is_disallowed("192.168.1.1".parse().unwrap()));
        assert!(is_disallowed("169.254.0.1".parse().unwrap()));
        assert!(!is_disallowed("8.8.8.8".parse().unwrap()));
    }
}
