use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clients::credentials::{AccessToken, TokenProvider};
use crate::error::RelayResult;

/// Hands out a fixed token and remembers which audiences asked for one.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().await.clone()
    }
}

impl TokenProvider for StaticTokenProvider {
    async fn token(&self, audience: &str) -> RelayResult<AccessToken> {
        self.requests.lock().await.push(audience.to_owned());
        Ok(AccessToken::new(self.token.clone(), None))
    }
}
