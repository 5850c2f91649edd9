use reqwest::Client;
use tracing::{debug, instrument, warn};

use crate::config::{Endpoints, RP_MINECRAFT, RP_XBOXLIVE_AUTH};
use crate::errors::{AuthError, Result, XstsError};
use crate::models::{
    XblAuthProperties, XblAuthRequest, XblAuthResponse, XstsAuthProperties, XstsAuthRequest,
    XstsErrorResponse,
};

/// Xbox Live or XSTS token with the user hash it was issued for
#[derive(Clone)]
pub struct XboxToken {
    pub token: String,
    pub user_hash: String,
}

impl std::fmt::Debug for XboxToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XboxToken")
            .field("token", &"<redacted>")
            .field("user_hash", &self.user_hash)
            .finish()
    }
}

impl TryFrom<XblAuthResponse> for XboxToken {
    type Error = AuthError;

    fn try_from(res: XblAuthResponse) -> Result<Self> {
        let user_hash = res
            .display_claims
            .xui
            .into_iter()
            .next()
            .map(|claim| claim.uhs)
            .filter(|uhs| !uhs.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("Missing XUI claims".to_string()))?;

        Ok(Self {
            token: res.token,
            user_hash,
        })
    }
}

/// Xbox Live user authentication and XSTS authorization
#[derive(Debug, Clone)]
pub struct XboxChain {
    http: Client,
    endpoints: Endpoints,
}

impl XboxChain {
    pub fn new(http: Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Trade a Microsoft access token for an Xbox Live user token
    #[instrument(skip_all)]
    pub async fn sign_in_xbox_live(&self, ms_access_token: &str) -> Result<XboxToken> {
        let request = XblAuthRequest {
            properties: XblAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("d={}", ms_access_token),
            },
            relying_party: RP_XBOXLIVE_AUTH.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authenticating with Xbox Live");
        let response = self
            .http
            .post(self.endpoints.xbl_authenticate.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::from_response(response).await);
        }

        let res: XblAuthResponse = response.json().await?;
        res.try_into()
    }

    /// Authorize the Xbox Live token for Minecraft services
    #[instrument(skip_all)]
    pub async fn get_xsts_token(&self, xbl: &XboxToken) -> Result<XboxToken> {
        let request = XstsAuthRequest {
            properties: XstsAuthProperties {
                sandbox_id: "RETAIL".to_string(),
                user_tokens: vec![xbl.token.clone()],
            },
            relying_party: RP_MINECRAFT.to_string(),
            token_type: "JWT".to_string(),
        };

        debug!("Authorizing with XSTS");
        let response = self
            .http
            .post(self.endpoints.xsts_authorize.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        // XErr denials usually come as 401, but the code wins whatever the status
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match serde_json::from_str::<XstsErrorResponse>(&body) {
                Ok(err) => {
                    warn!(
                        "XSTS denied the account (status {}, XErr {}): {}",
                        status,
                        err.xerr,
                        err.message.as_deref().unwrap_or("no message")
                    );
                    Err(XstsError::from_xerr(err.xerr).into())
                }
                Err(_) => Err(AuthError::Http {
                    status,
                    body_snippet: body.chars().take(200).collect(),
                }),
            };
        }

        let res: XblAuthResponse = response.json().await?;
        let xsts = XboxToken::try_from(res)?;
        if xsts.user_hash != xbl.user_hash {
            warn!("XSTS user hash differs from the Xbox Live one, using the XSTS hash");
        }
        Ok(xsts)
    }
}
