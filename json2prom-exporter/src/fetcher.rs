//! One HTTP request per poll cycle.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Url};
use tracing::trace;

use crate::config::TargetConfig;
use crate::error::{FetchError, TargetInitError};

const ALLOWED_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

/// Builds and sends the request of one target.
///
/// Everything that can be rejected is checked by [`Fetcher::new`], so a
/// running fetcher only fails on transport or status errors.
#[derive(Debug, Clone)]
pub struct Fetcher {
    target: String,
    client: Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    form: Option<Vec<(String, String)>>,
    timeout: Duration,
}

impl Fetcher {
    /// Validate a target's request settings.
    ///
    /// `auth_header` is the externally supplied authorization value, sent
    /// verbatim when the target sets `includeAuthHeader`.
    pub fn new(
        config: &TargetConfig,
        client: Client,
        auth_header: Option<&str>,
    ) -> Result<Self, TargetInitError> {
        Self::with_env(config, client, auth_header, |var| std::env::var(var).ok())
    }

    /// Like [`Fetcher::new`], resolving `useBearerTokenFrom` through `env`.
    pub(crate) fn with_env(
        config: &TargetConfig,
        client: Client,
        auth_header: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TargetInitError> {
        let method = parse_method(config)?;

        let url = Url::parse(&config.uri).map_err(|e| TargetInitError::InvalidUri {
            target: config.name.clone(),
            uri: config.uri.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TargetInitError::InvalidUri {
                target: config.name.clone(),
                uri: config.uri.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        let mut headers = HeaderMap::with_capacity(config.headers.len() + 1);
        for (name, value) in &config.headers {
            let invalid = |reason: String| TargetInitError::InvalidHeader {
                target: config.name.clone(),
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header_name, header_value);
        }

        if let Some(authorization) = authorization(config, auth_header, env)? {
            let mut value =
                HeaderValue::from_str(&authorization).map_err(|e| TargetInitError::InvalidHeader {
                    target: config.name.clone(),
                    name: AUTHORIZATION.to_string(),
                    reason: e.to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let form = config
            .form_params
            .as_ref()
            .map(|params| params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

        Ok(Self {
            target: config.name.clone(),
            client,
            method,
            url,
            headers,
            form,
            timeout: config.request_timeout(),
        })
    }

    /// Send the request and return the body of a 2xx response.
    ///
    /// No retries: a failure is reported and the next tick tries again.
    pub async fn fetch(&self) -> Result<Bytes, FetchError> {
        let mut request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .timeout(self.timeout);

        if let Some(form) = &self.form {
            request = request.form(form);
        }

        let response = request.send().await.map_err(|source| FetchError::Transport {
            target: self.target.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                target: self.target.clone(),
                status,
            });
        }

        let body = response.bytes().await.map_err(|source| FetchError::Body {
            target: self.target.clone(),
            source,
        })?;

        trace!(target = %self.target, bytes = body.len(), "Fetched response body");
        Ok(body)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

fn parse_method(config: &TargetConfig) -> Result<Method, TargetInitError> {
    let unsupported = || TargetInitError::InvalidMethod {
        target: config.name.clone(),
        method: config.method.clone(),
    };

    let method = Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| unsupported())?;
    if ALLOWED_METHODS.contains(&method) {
        Ok(method)
    } else {
        Err(unsupported())
    }
}

fn authorization(
    config: &TargetConfig,
    auth_header: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Option<String>, TargetInitError> {
    if config.include_auth_header {
        return match auth_header.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Ok(Some(value.to_string())),
            None => Err(TargetInitError::MissingAuthHeader {
                target: config.name.clone(),
            }),
        };
    }

    if let Some(var) = &config.use_bearer_token_from {
        return match env(var) {
            Some(token) if !token.trim().is_empty() => {
                Ok(Some(format!("Bearer {}", token.trim())))
            }
            _ => Err(TargetInitError::MissingBearerToken {
                target: config.name.clone(),
                var: var.clone(),
            }),
        };
    }

    Ok(None)
}
