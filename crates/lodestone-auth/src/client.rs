use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::device_code::DeviceCodeChallenge;
use crate::errors::{AuthError, Result};
use crate::models::{MsDeviceCodeResponse, MsOAuthError, MsTokenResponse};
use crate::session::{AccountHandle, MsTokens};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Floor for the device code poll interval
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A device code waiting for the user
#[derive(Debug, Clone)]
pub struct PendingDeviceCode {
    pub device_code: String,
    pub challenge: DeviceCodeChallenge,
    pub interval: Duration,
}

impl From<MsDeviceCodeResponse> for PendingDeviceCode {
    fn from(res: MsDeviceCodeResponse) -> Self {
        Self {
            device_code: res.device_code,
            interval: Duration::from_secs(res.interval).max(MIN_POLL_INTERVAL),
            challenge: DeviceCodeChallenge {
                user_code: res.user_code,
                verification_uri: res.verification_uri,
                verification_uri_complete: res.verification_uri_complete,
                message: res.message,
                expires_in_seconds: res.expires_in,
            },
        }
    }
}

/// Outcome of one device code poll
#[derive(Debug)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Granted(MsTokens),
}

/// Client for the Microsoft identity provider
#[derive(Debug, Clone)]
pub struct MicrosoftClient {
    config: AuthConfig,
    http: Client,
}

impl MicrosoftClient {
    /// Create a new identity provider client
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = config.http_client()?;
        Ok(Self { config, http })
    }

    /// Share an existing HTTP client
    pub fn with_http(config: AuthConfig, http: Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// New account handle for a grant issued by this client
    pub fn new_account(&self) -> Result<AccountHandle> {
        AccountHandle::new(&self.config.client_id, &self.config.authority)
    }

    /// Start a device code grant
    #[instrument(skip(self))]
    pub async fn request_device_code(&self) -> Result<PendingDeviceCode> {
        let scope = self.config.scope();
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("Requesting device code");
        let response = self
            .http
            .post(self.config.endpoints.device_code.clone())
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(oauth_failure(response).await);
        }

        let res: MsDeviceCodeResponse = response.json().await?;
        Ok(res.into())
    }

    /// Ask the token endpoint whether the user completed the device code
    #[instrument(skip(self, device_code))]
    pub async fn poll_device_token(&self, device_code: &str) -> Result<DevicePoll> {
        let form = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", self.config.client_id.as_str()),
            ("device_code", device_code),
        ];

        match self.token_request(&form).await? {
            Ok(tokens) => Ok(DevicePoll::Granted(tokens)),
            Err(err) => match err.error.as_str() {
                "authorization_pending" => Ok(DevicePoll::Pending),
                "slow_down" => Ok(DevicePoll::SlowDown),
                "authorization_declined" | "access_denied" => Err(AuthError::UserCancelled),
                "expired_token" | "code_expired" | "invalid_grant" => {
                    Err(AuthError::ExpiredChallenge)
                }
                _ => Err(rejection(err)),
            },
        }
    }

    /// Build the authorization URL for the browser flow
    #[instrument(skip(self, code_challenge))]
    pub fn build_authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> Url {
        let mut url = self.config.endpoints.authorize.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.config.scope())
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("prompt", "select_account");

        debug!("Built authorize URL: {}", url);
        url
    }

    /// Authorization URL the user can open by hand when every automatic flow failed
    pub fn manual_sign_in_url(&self) -> Url {
        let mut url = self.config.endpoints.authorize.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scope())
            .append_pair(
                "redirect_uri",
                &format!("http://localhost:{}", self.config.redirect_port),
            );
        url
    }

    /// Exchange authorization code for Microsoft tokens
    #[instrument(skip(self, code, code_verifier))]
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<MsTokens> {
        let scope = self.config.scope();
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
            ("scope", scope.as_str()),
        ];

        debug!("Exchanging authorization code for tokens");
        self.token_request(&form).await?.map_err(rejection)
    }

    /// Silently mint new Microsoft tokens from a refresh token
    #[instrument(skip(self, refresh_token, account))]
    pub async fn refresh(&self, refresh_token: &str, account: &AccountHandle) -> Result<MsTokens> {
        if !account.belongs_to(&self.config.client_id, &self.config.authority) {
            warn!("Account handle was issued for another client or authority");
            return Err(AuthError::AccountUnavailable);
        }

        let scope = self.config.scope();
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];

        debug!("Refreshing Microsoft access token");
        self.token_request(&form).await?.map_err(rejection)
    }

    /// POST to the token endpoint; OAuth errors come back as the inner `Err`
    async fn token_request<T: Serialize + ?Sized>(
        &self,
        form: &T,
    ) -> Result<std::result::Result<MsTokens, MsOAuthError>> {
        let response = self
            .http
            .post(self.config.endpoints.token.clone())
            .form(form)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let res: MsTokenResponse = response.json().await?;
                if !res.token_type.eq_ignore_ascii_case("bearer") {
                    warn!("Unexpected Microsoft token type: {}", res.token_type);
                }
                debug!("Microsoft access token valid for {}s", res.expires_in);
                Ok(Ok(MsTokens::new(res.access_token, res.refresh_token)))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<MsOAuthError>(&body) {
                    Ok(err) => Ok(Err(err)),
                    Err(_) => Err(AuthError::Http {
                        status,
                        body_snippet: body.chars().take(200).collect(),
                    }),
                }
            }
            _ => Err(oauth_failure(response).await),
        }
    }
}

fn rejection(err: MsOAuthError) -> AuthError {
    AuthError::ProviderRejection {
        description: err.error_description.unwrap_or_else(|| err.error.clone()),
        code: err.error,
    }
}

async fn oauth_failure(response: reqwest::Response) -> AuthError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<MsOAuthError>(&body) {
        Ok(err) => rejection(err),
        Err(_) => AuthError::Http {
            status,
            body_snippet: body.chars().take(200).collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fixtures;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> MicrosoftClient {
        MicrosoftClient::new(AuthConfig::rooted_at(&server.uri()).unwrap()).unwrap()
    }

    fn account_for(client: &MicrosoftClient) -> AccountHandle {
        client.new_account().unwrap()
    }

    #[tokio::test]
    async fn test_request_device_code_normalizes_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .and(body_string_contains("scope=XboxLive.signin+offline_access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "deviceCode": "dev-123",
                "userCode": "ABCD1234",
                "verificationUri": "https://microsoft.com/devicelogin",
                "expiresIn": 900,
                "interval": 3,
                "message": "Enter ABCD1234"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let pending = client_for(&server).await.request_device_code().await.unwrap();
        assert_eq!(pending.device_code, "dev-123");
        assert_eq!(pending.interval, Duration::from_secs(3));
        assert_eq!(pending.challenge.user_code, "ABCD1234");
        assert_eq!(
            pending.challenge.verification_uri,
            "https://microsoft.com/devicelogin"
        );
        assert_eq!(pending.challenge.expires_in_seconds, 900);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_is_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dev-123",
                "user_code": "ABCD1234",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 0,
                "message": "Enter ABCD1234"
            })))
            .mount(&server)
            .await;

        let pending = client_for(&server).await.request_device_code().await.unwrap();
        assert_eq!(pending.interval, MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_device_code_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS700016: unknown application"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .request_device_code()
            .await
            .unwrap_err();
        match err {
            AuthError::ProviderRejection { code, description } => {
                assert_eq!(code, "invalid_client");
                assert!(description.contains("AADSTS700016"));
            }
            other => panic!("Expected ProviderRejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "authorization_pending"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "slow_down"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .and(body_string_contains("device_code=dev-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ms_access",
                "refresh_token": "ms_refresh",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(matches!(
            client.poll_device_token("dev-123").await.unwrap(),
            DevicePoll::Pending
        ));
        assert!(matches!(
            client.poll_device_token("dev-123").await.unwrap(),
            DevicePoll::SlowDown
        ));
        match client.poll_device_token("dev-123").await.unwrap() {
            DevicePoll::Granted(tokens) => {
                assert_eq!(tokens.access_token, "ms_access");
                assert_eq!(tokens.refresh_token.as_deref(), Some("ms_refresh"));
            }
            other => panic!("Expected Granted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_invalid_grant_means_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: the grant is expired"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .poll_device_token("dev")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredChallenge));
        assert!(err.to_string().contains("retry"));
    }

    #[tokio::test]
    async fn test_poll_declined_means_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": "authorization_declined"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .poll_device_token("dev")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserCancelled));
    }

    #[tokio::test]
    async fn test_refresh_rotates_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old_refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new_access",
                "refresh_token": "new_refresh",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let account = account_for(&client);
        let tokens = client.refresh("old_refresh", &account).await.unwrap();
        assert_eq!(tokens.access_token, "new_access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("new_refresh"));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let account = account_for(&client);
        let err = client.refresh("old", &account).await.unwrap_err();
        assert!(
            matches!(err, AuthError::ProviderRejection { ref code, .. } if code == "invalid_grant")
        );
    }

    #[tokio::test]
    async fn test_refresh_with_foreign_account_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        // Handle issued against the production authority, client points at the mock
        let err = client_for(&server)
            .await
            .refresh("refresh", &fixtures::account())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountUnavailable));
    }

    #[tokio::test]
    async fn test_exchange_code_sends_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ms_access",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client_for(&server)
            .await
            .exchange_code("the-code", "the-verifier", "http://localhost:53682")
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "ms_access");
        assert_eq!(tokens.refresh_token, None);
    }

    #[tokio::test]
    async fn test_unexpected_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let account = account_for(&client);
        let err = client.refresh("refresh", &account).await.unwrap_err();
        match err {
            AuthError::Http {
                status,
                body_snippet,
            } => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body_snippet, "maintenance");
            }
            other => panic!("Expected Http error, got {:?}", other),
        }
    }

    #[test]
    fn test_authorize_url_parameters() {
        let client = MicrosoftClient::new(AuthConfig::default()).unwrap();
        let url = client.build_authorize_url("http://localhost:53682", "st4te", "ch4llenge");
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(params["client_id"], crate::config::CLIENT_ID);
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "http://localhost:53682");
        assert_eq!(params["scope"], "XboxLive.signin offline_access");
        assert_eq!(params["state"], "st4te");
        assert_eq!(params["code_challenge"], "ch4llenge");
        assert_eq!(params["code_challenge_method"], "S256");
    }

    #[test]
    fn test_manual_url_points_at_loopback() {
        let client = MicrosoftClient::new(AuthConfig::default()).unwrap();
        let url = client.manual_sign_in_url();
        assert!(url.as_str().starts_with(crate::config::endpoints::MS_AUTHORIZE));
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "redirect_uri" && v == "http://localhost:53682"));
    }
}
