//! Identity provider client
//!
//! Resolves a verified token subject into a display identity by asking the
//! external account service: `GET <base>/accounts/<subject>` with the
//! caller's bearer token. Anything but `200 OK` is a failed lookup.

use chatrelay_core::{Error, Identity, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves token subjects to display identities.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn lookup(&self, subject_id: &str, token: &str) -> Result<Identity>;
}

/// Account document returned by the provider. Only `nickname` is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    nickname: String,
    #[serde(default)]
    username: Option<String>,
}

pub struct HttpIdentityProvider {
    client: Client,
    base_url: Url,
}

impl HttpIdentityProvider {
    /// Every request is bounded by `timeout`.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.as_ref();
        let parsed = Url::parse(base_url)
            .map_err(|e| Error::config(format!("identity url {}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(Error::config(format!("identity url {} cannot be a base", base_url)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("identity client: {}", e)))?;
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    /// The subject becomes a single escaped path segment.
    fn account_url(&self, subject_id: &str) -> Result<Url> {
        if matches!(subject_id, "" | "." | "..") {
            return Err(Error::identity_lookup(format!(
                "subject {:?} is not a valid account id",
                subject_id
            )));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config("identity url cannot be a base"))?
            .pop_if_empty()
            .push("accounts")
            .push(subject_id);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn lookup(&self, subject_id: &str, token: &str) -> Result<Identity> {
        let url = self.account_url(subject_id)?;
        debug!(subject = subject_id, %url, "fetching account");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                warn!(subject = subject_id, error = %e, "identity provider unreachable");
                Error::identity_lookup(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(subject = subject_id, %status, "identity provider rejected lookup");
            return Err(Error::identity_lookup(format!("provider returned {}", status)));
        }

        let account: Account = response
            .json()
            .await
            .map_err(|e| Error::identity_lookup(format!("malformed account: {}", e)))?;
        debug!(subject = subject_id, username = ?account.username, "account resolved");

        Ok(Identity::new(subject_id, account.nickname))
    }
}
