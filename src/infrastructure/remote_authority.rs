//! Remote dedup authority
//!
//! System-of-record lookup consulted as the last dedup tier for items.
//! `GET <endpoint>?url=<url>` answers with an integer body: 0 unseen, 1 seen.

use std::time::Duration;

use tracing::debug;
use url::Url;

use super::config::Locale;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote authority request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote authority answered neither 0 nor 1: {0:?}")]
    UnexpectedBody(String),

    #[error("Invalid remote authority endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("Domestic sources require a remote authority endpoint")]
    MissingEndpoint,
}

#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpAuthority {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
        })
    }

    pub async fn exists(&self, url: &str) -> Result<bool, RemoteError> {
        let body = self
            .client
            .get(self.endpoint.clone())
            .query(&[("url", url)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let seen = parse_answer(&body)?;
        debug!(url, seen, "remote authority answered");
        Ok(seen)
    }
}

fn parse_answer(body: &str) -> Result<bool, RemoteError> {
    match body.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(RemoteError::UnexpectedBody(body.to_string())),
    }
}

/// Tier-3 lookup selected by deployment locale
#[derive(Debug, Clone)]
pub enum RemoteAuthority {
    Http(HttpAuthority),
    /// Every URL is reported unseen
    Disabled,
}

impl RemoteAuthority {
    /// `Domestic` consults `endpoint`; `Overseas` disables the tier
    pub fn for_locale(locale: Locale, endpoint: Option<&str>, timeout: Duration) -> Result<Self, RemoteError> {
        match locale {
            Locale::Domestic => {
                let endpoint = endpoint.ok_or(RemoteError::MissingEndpoint)?;
                Ok(Self::Http(HttpAuthority::new(endpoint, timeout)?))
            }
            Locale::Overseas => Ok(Self::Disabled),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    pub async fn exists(&self, url: &str) -> Result<bool, RemoteError> {
        match self {
            Self::Http(authority) => authority.exists(url).await,
            Self::Disabled => Ok(false),
        }
    }
}
