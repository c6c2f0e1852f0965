//! Credential exchange with the relay's HTTP endpoints.

use confab_core::Identity;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuthError;

#[derive(Debug, Clone, Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthAccepted {
    #[allow(dead_code)]
    status: String,
    username: Identity,
}

#[derive(Debug, Deserialize)]
struct AuthRejected {
    detail: String,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: Url,
}

impl AuthClient {
    pub fn new(server_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(server_url)?,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        self.post("/login", username, password).await
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<Identity, AuthError> {
        self.post("/signup", username, password).await
    }

    async fn post(
        &self,
        path: &str,
        username: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let mut endpoint = self.base_url.clone();
        endpoint.set_path(path);

        let response = self
            .http
            .post(endpoint)
            .json(&Credentials { username, password })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let accepted: AuthAccepted = response.json().await?;
            return Ok(accepted.username);
        }

        // The relay reports validation failures as 400 with a detail
        // string; surface that verbatim.
        if status.as_u16() == 400 {
            let rejected: AuthRejected = response.json().await?;
            return Err(AuthError::Rejected {
                detail: rejected.detail,
            });
        }

        Err(AuthError::UnexpectedStatus(status.as_u16()))
    }
}
