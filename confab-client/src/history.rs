//! The message-history collaborator.
//!
//! A plain HTTP GET for the full past conversation between two
//! identities. Failures here are non-fatal: the conversation view keeps
//! whatever live and optimistic messages it already holds.

use confab_core::HistoryMessage;
use url::Url;

use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HistoryClient {
    pub fn new(server_url: &str) -> Result<Self, FetchError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(server_url)?,
        })
    }

    /// Fetch the ordered past messages between `user1` and `user2`.
    pub async fn fetch(
        &self,
        user1: &str,
        user2: &str,
    ) -> Result<Vec<HistoryMessage>, FetchError> {
        let mut endpoint = self.base_url.clone();
        endpoint.set_path("/get_messages");
        endpoint
            .query_pairs_mut()
            .append_pair("user1", user1)
            .append_pair("user2", user2);

        let response = self.http.get(endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus(status.as_u16()));
        }

        Ok(response.json().await?)
    }
}
