use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use crate::config::Endpoints;
use crate::errors::{AuthError, Result};
use crate::models::{McEntitlements, McLoginRequest, McLoginResponse, McProfile};

/// Entitlement names that grant the Java edition
const GAME_ENTITLEMENTS: &[&str] = &["product_minecraft", "game_minecraft"];

/// Minecraft services bearer token
#[derive(Clone)]
pub struct MinecraftToken {
    pub access_token: String,
    pub token_type: String,
    /// Reported by the service, session expiry uses a fixed TTL instead
    pub expires_in: u64,
}

impl std::fmt::Debug for MinecraftToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinecraftToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Minecraft services login, ownership and profile
#[derive(Debug, Clone)]
pub struct MinecraftIdentity {
    http: Client,
    endpoints: Endpoints,
}

impl MinecraftIdentity {
    pub fn new(http: Client, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }

    /// Login to Minecraft with an XSTS token
    #[instrument(skip_all)]
    pub async fn login_with_xbox(
        &self,
        xsts_token: &str,
        user_hash: &str,
    ) -> Result<MinecraftToken> {
        let request = McLoginRequest {
            identity_token: format!("XBL3.0 x={};{}", user_hash, xsts_token),
        };

        debug!("Logging in to Minecraft Services");
        let response = self
            .http
            .post(self.endpoints.mc_login.clone())
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::from_response(response).await);
        }

        let res: McLoginResponse = response.json().await?;
        if res.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Empty Minecraft access token".to_string(),
            ));
        }
        if !res.token_type.eq_ignore_ascii_case("bearer") {
            warn!("Unexpected Minecraft token type: {}", res.token_type);
        }

        Ok(MinecraftToken {
            access_token: res.access_token,
            token_type: res.token_type,
            expires_in: res.expires_in,
        })
    }

    /// Whether the account owns the game
    #[instrument(skip_all)]
    pub async fn check_ownership(&self, mc_access_token: &str) -> Result<bool> {
        debug!("Checking game entitlements");
        let response = self
            .http
            .get(self.endpoints.mc_entitlements.clone())
            .bearer_auth(mc_access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::from_response(response).await);
        }

        let entitlements: McEntitlements = response.json().await?;
        let owned = entitlements
            .items
            .iter()
            .any(|item| GAME_ENTITLEMENTS.contains(&item.name.as_str()));
        debug!(
            "{} entitlements, game owned: {}",
            entitlements.items.len(),
            owned
        );
        Ok(owned)
    }

    /// Fetch the player profile
    #[instrument(skip_all)]
    pub async fn get_profile(&self, mc_access_token: &str) -> Result<McProfile> {
        debug!("Fetching Minecraft profile");
        let response = self
            .http
            .get(self.endpoints.mc_profile.clone())
            .bearer_auth(mc_access_token)
            .send()
            .await?;

        // The account exists but never picked a player name
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AuthError::ProfileMissing);
        }

        if !response.status().is_success() {
            return Err(AuthError::from_response(response).await);
        }

        let profile: McProfile = response.json().await?;
        if profile.id.is_empty() || profile.name.is_empty() {
            return Err(AuthError::InvalidResponse(
                "Profile without id or name".to_string(),
            ));
        }
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity_for(server: &MockServer) -> MinecraftIdentity {
        MinecraftIdentity::new(
            Client::new(),
            Endpoints::rooted_at(&server.uri()).unwrap(),
        )
    }

    async fn mount_entitlements(server: &MockServer, items: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/entitlements/mcstore"))
            .and(header("Authorization", "Bearer mc_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": items,
                "signature": "sig",
                "keyId": "1"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_login_with_xbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authentication/login_with_xbox"))
            .and(body_json(json!({ "identityToken": "XBL3.0 x=uhs123;xsts_token" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "username": "some-uuid",
                "roles": [],
                "access_token": "mc_token",
                "token_type": "Bearer",
                "expires_in": 86400
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = identity_for(&server)
            .login_with_xbox("xsts_token", "uhs123")
            .await
            .unwrap();
        assert_eq!(token.access_token, "mc_token");
        assert_eq!(token.expires_in, 86400);
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authentication/login_with_xbox"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let err = identity_for(&server)
            .login_with_xbox("xsts_token", "uhs123")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Http {
                status: StatusCode::FORBIDDEN,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ownership_from_either_entitlement() {
        for name in ["product_minecraft", "game_minecraft"] {
            let server = MockServer::start().await;
            mount_entitlements(&server, json!([{ "name": name, "signature": "x" }])).await;

            assert!(
                identity_for(&server)
                    .check_ownership("mc_token")
                    .await
                    .unwrap(),
                "{name} should grant ownership"
            );
        }
    }

    #[tokio::test]
    async fn test_no_ownership() {
        let server = MockServer::start().await;
        mount_entitlements(&server, json!([{ "name": "product_dungeons" }])).await;
        assert!(!identity_for(&server).check_ownership("mc_token").await.unwrap());

        let server = MockServer::start().await;
        mount_entitlements(&server, json!([])).await;
        assert!(!identity_for(&server).check_ownership("mc_token").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/minecraft/profile"))
            .and(header("Authorization", "Bearer mc_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "069a79f444e94726a5befca90e38aaf5",
                "name": "Steve",
                "skins": [{
                    "id": "skin-1",
                    "state": "ACTIVE",
                    "url": "http://textures.minecraft.net/texture/abc",
                    "variant": "CLASSIC"
                }],
                "capes": []
            })))
            .mount(&server)
            .await;

        let profile = identity_for(&server).get_profile("mc_token").await.unwrap();
        assert_eq!(profile.name, "Steve");
        assert_eq!(profile.skins.len(), 1);
        assert_eq!(profile.skins[0].variant, "CLASSIC");
    }

    #[tokio::test]
    async fn test_profile_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/minecraft/profile"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "path": "/minecraft/profile",
                "errorType": "NOT_FOUND"
            })))
            .mount(&server)
            .await;

        let err = identity_for(&server)
            .get_profile("mc_token")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ProfileMissing));
    }
}
