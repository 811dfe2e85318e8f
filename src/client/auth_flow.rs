use super::ClientError;
use crate::{auth::TokenResponse, services::commerce::MergeOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Server calls made around sign-in.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Guest session the client has been shopping under, if any.
    fn guest_token(&self) -> Option<String>;
    async fn login(&self, email: &str, password: &str) -> Result<TokenResponse, ClientError>;
    async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ClientError>;
    async fn merge_guest_cart(&self, guest_token: &str) -> Result<MergeOutcome, ClientError>;
}

#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub token: TokenResponse,
    /// `None` when there was no guest session or the merge failed.
    pub merge: Option<MergeOutcome>,
}

/// Signs the user in and folds their guest cart into the account cart.
pub struct AuthFlow<G> {
    gateway: Arc<G>,
}

impl<G: AuthGateway> AuthFlow<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthOutcome, ClientError> {
        let guest_token = self.gateway.guest_token();
        let token = self.gateway.login(email, password).await?;
        let merge = self.merge(guest_token).await;
        Ok(AuthOutcome { token, merge })
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<AuthOutcome, ClientError> {
        let guest_token = self.gateway.guest_token();
        let token = self.gateway.register(name, email, password).await?;
        let merge = self.merge(guest_token).await;
        Ok(AuthOutcome { token, merge })
    }

    /// Merge failures never undo the sign-in; the guest cart simply stays
    /// behind.
    async fn merge(&self, guest_token: Option<String>) -> Option<MergeOutcome> {
        let guest_token = guest_token?;
        match self.gateway.merge_guest_cart(&guest_token).await {
            Ok(outcome) => {
                if !outcome.adjustments.is_empty() {
                    info!(
                        adjustments = outcome.adjustments.len(),
                        "guest cart merged with reduced quantities"
                    );
                }
                Some(outcome)
            }
            Err(err) => {
                warn!(error = %err, "failed to merge guest cart");
                None
            }
        }
    }
}
