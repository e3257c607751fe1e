//! Customer-account credential issuance
//!
//! The orchestrator never holds long-lived customer credentials; it assumes a
//! role in the customer account per operation. The trait keeps the STS
//! dependency out of the services so they can be exercised with canned
//! credentials.

use async_trait::async_trait;
use thiserror::Error;

use caravel_core::payload::Credentials;

use crate::aws::{ErrorKind, classify, retry};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("assume-role failed for account {account}: {message}")]
    AssumeRole { account: String, message: String },
}

/// Issues temporary credentials for a customer account
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Returns `None` when the account link no longer grants access; the
    /// caller backs off and leaves the run to its timeout monitor
    async fn assume_role(&self, aws_account_id: &str)
    -> Result<Option<Credentials>, CredentialError>;
}

/// STS-backed issuer
pub struct StsCredentialIssuer {
    client: aws_sdk_sts::Client,
    role_name: String,
}

impl StsCredentialIssuer {
    pub fn new(sdk_config: &aws_config::SdkConfig, role_name: String) -> Self {
        Self {
            client: aws_sdk_sts::Client::new(sdk_config),
            role_name,
        }
    }
}

#[async_trait]
impl CredentialIssuer for StsCredentialIssuer {
    async fn assume_role(
        &self,
        aws_account_id: &str,
    ) -> Result<Option<Credentials>, CredentialError> {
        let role_arn = format!("arn:aws:iam::{}:role/{}", aws_account_id, self.role_name);

        let result = retry("sts.assume_role", || {
            self.client
                .assume_role()
                .role_arn(&role_arn)
                .role_session_name("caravel-orchestrator")
                .send()
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if matches!(classify(&err), ErrorKind::AccessDenied | ErrorKind::NotFound) => {
                tracing::warn!(account = aws_account_id, "account role is not assumable");
                return Ok(None);
            }
            Err(err) => {
                return Err(CredentialError::AssumeRole {
                    account: aws_account_id.to_string(),
                    message: err.to_string(),
                });
            }
        };

        let Some(credentials) = output.credentials else {
            return Ok(None);
        };

        Ok(Some(Credentials {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            session_token: credentials.session_token,
        }))
    }
}
