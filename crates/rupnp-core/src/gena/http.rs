//! HTTP client seam for the GENA exchanges.
//!
//! The engine only needs "send method + headers, get status + headers
//! back"; everything else about HTTP stays outside the core. A blocking
//! `ureq`-backed implementation ships behind the `ureq-client` feature;
//! tests plug in recording fakes.

use std::time::Duration;

use crate::error::{Result, UpnpError};

/// Response surface the GENA engine consumes: status plus headers, with
/// case-insensitive header lookup. Bodies are never needed.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>) -> Self {
        Self { status, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Blocking request with a custom verb. Implementations return
/// [`UpnpError::Transport`] for connect/transport failures; HTTP error
/// statuses come back as ordinary responses.
pub trait HttpClient: Send + Sync {
    fn request(&self, method: &str, url: &str, headers: &[(String, String)])
        -> Result<HttpResponse>;
}

/// Default exchange timeout, whole-request.
pub const HTTP_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(feature = "ureq-client")]
pub use ureq_client::UreqClient;

#[cfg(feature = "ureq-client")]
mod ureq_client {
    use super::*;

    /// [`HttpClient`] over a blocking `ureq` agent.
    pub struct UreqClient {
        agent: ureq::Agent,
    }

    impl UreqClient {
        pub fn new() -> Self {
            Self {
                agent: ureq::builder().timeout(HTTP_DEFAULT_TIMEOUT).build(),
            }
        }
    }

    impl Default for UreqClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HttpClient for UreqClient {
        fn request(
            &self,
            method: &str,
            url: &str,
            headers: &[(String, String)],
        ) -> Result<HttpResponse> {
            let mut req = self.agent.request(method, url);
            for (name, value) in headers {
                req = req.set(name, value);
            }
            let response = match req.call() {
                Ok(r) => r,
                // Non-2xx is still a response; the engine decides what it
                // means.
                Err(ureq::Error::Status(_, r)) => r,
                Err(ureq::Error::Transport(t)) => {
                    return Err(UpnpError::Transport(t.to_string()));
                }
            };
            let headers = response
                .headers_names()
                .into_iter()
                .filter_map(|name| {
                    response
                        .header(&name)
                        .map(|v| (name.clone(), v.to_string()))
                })
                .collect();
            Ok(HttpResponse::new(response.status(), headers))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = HttpResponse::new(
            200,
            vec![
                ("SID".into(), "uuid:abc".into()),
                ("TIMEOUT".into(), "Second-1800".into()),
            ],
        );
        assert_eq!(resp.header("sid"), Some("uuid:abc"));
        assert_eq!(resp.header("Timeout"), Some("Second-1800"));
        assert_eq!(resp.header("location"), None);
    }
}
