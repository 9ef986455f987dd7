//! Cloud access: sign-in, session credentials and the console list.
//!
//! Everything here is plain HTTPS against the vendor's cloud. The session
//! credentials returned by `create-credentials` are what the relay stack
//! signs its broker URL with; the TURN servers inside them are handed to the
//! peer connection.
//!
//! The SSO session lives in the client's cookie store, so one
//! [`CloudAccess`] value must be used for login, MFA and the calls after.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{API_GATEWAY_SERVICE, CLOUD_ACCESS_CONFIG_URL, HTTP_REQUEST_TIMEOUT, SSO_BASE_URL};
use crate::sigv4::{self, AuthMode, CanonicalRequest};
use crate::webrtc::IceServer;

/// Status the SSO login answers with when a second factor is required.
const MFA_REQUIRED: u16 = 499;

/// Accept header sent on every call.
const ACCEPT_JSON: &str = "application/json, text/plain, */*";

/// Where the cloud lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    /// Cloud access configuration document.
    pub access_config_url: String,
    /// SSO API base, without trailing slash.
    pub sso_base_url: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            access_config_url: CLOUD_ACCESS_CONFIG_URL.to_string(),
            sso_base_url: SSO_BASE_URL.to_string(),
            request_timeout: HTTP_REQUEST_TIMEOUT,
        }
    }
}

/// Cloud access configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Relay endpoints.
    pub unifi_cloud_access: CloudEndpoints,
}

/// Relay endpoints from [`AccessConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudEndpoints {
    /// MQTT broker.
    pub iot: IotEndpoint,
    /// API gateway for device listing.
    #[serde(rename = "apiGateway")]
    pub api_gateway: GatewayEndpoint,
    /// API gateway for credential creation.
    #[serde(rename = "apiGatewayUI")]
    pub api_gateway_ui: GatewayEndpoint,
}

/// Broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IotEndpoint {
    /// Broker host name.
    pub host: String,
}

/// HTTP gateway endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayEndpoint {
    /// Gateway URL; only scheme and authority are used.
    pub url: String,
}

/// TURN credentials bundled with a session.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TurnCredentials {
    /// TURN username.
    pub username: String,
    /// TURN password.
    pub password: String,
    /// TURN URIs, already filtered.
    pub uris: Vec<String>,
}

impl std::fmt::Debug for TurnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentials")
            .field("username", &self.username)
            .field("uris", &self.uris)
            .finish_non_exhaustive()
    }
}

/// Temporary credentials for one relay session.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret key; never logged.
    pub secret_key: String,
    /// Session token; never logged.
    pub session_token: String,
    /// Signing region.
    pub region: String,
    /// Identity the signaling topics are scoped to.
    pub identity_id: String,
    /// TURN servers.
    pub turn_credentials: TurnCredentials,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .field("identity_id", &self.identity_id)
            .field("turn_credentials", &self.turn_credentials)
            .finish_non_exhaustive()
    }
}

impl SessionCredentials {
    /// The TURN servers as one ICE server entry.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        vec![IceServer {
            urls: self.turn_credentials.uris.clone(),
            username: Some(self.turn_credentials.username.clone()),
            credential: Some(self.turn_credentials.password.clone()),
        }]
    }
}

/// Drop STUN URIs and TCP TURN on port 3478; the console does not pair with
/// them.
pub fn filter_turn_uris(uris: &[String]) -> Vec<String> {
    uris.iter()
        .filter(|uri| !uri.starts_with("stun:") && !uri.ends_with(":3478?transport=tcp"))
        .cloned()
        .collect()
}

/// One console registered with the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDeviceEntry {
    /// Device id used in the signaling topics.
    pub id: String,
    /// Everything else the cloud reports.
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// A second factor offered by the SSO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MfaFactor {
    /// Factor id.
    pub id: String,
    /// Factor kind.
    pub kind: MfaKind,
    /// Whether this is the account's default factor.
    pub preferred: bool,
}

/// Kind of second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaKind {
    /// Code sent by email to this address.
    Email(String),
    /// Anything else, by its type name.
    Other(String),
}

impl MfaFactor {
    /// Human readable description.
    pub fn description(&self) -> String {
        match &self.kind {
            MfaKind::Email(address) => format!("Email authorization via {address}"),
            MfaKind::Other(kind) => format!("{kind} authorization (unsupported)"),
        }
    }
}

/// Result of [`CloudAccess::login`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Signed in.
    Authenticated,
    /// A token from one of these factors must be passed to
    /// [`CloudAccess::verify_mfa`].
    MfaRequired(Vec<MfaFactor>),
}

#[derive(Debug, Deserialize)]
struct MfaChallenge {
    #[serde(default)]
    required: Option<String>,
    #[serde(default)]
    authenticators: Vec<RawFactor>,
    #[serde(default)]
    user: Option<ChallengeUser>,
}

#[derive(Debug, Deserialize)]
struct RawFactor {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeUser {
    #[serde(default)]
    default_mfa: Option<String>,
}

impl MfaChallenge {
    fn factors(self) -> Vec<MfaFactor> {
        let preferred = self.user.and_then(|u| u.default_mfa);
        self.authenticators
            .into_iter()
            .map(|raw| {
                let kind = match (raw.kind.as_str(), raw.email) {
                    ("email", Some(address)) => MfaKind::Email(address),
                    ("email", None) => MfaKind::Email(String::new()),
                    (other, _) => {
                        log::warn!("[Cloud] Unknown authenticator type {other}");
                        MfaKind::Other(other.to_string())
                    }
                };
                MfaFactor {
                    preferred: preferred.as_deref() == Some(raw.id.as_str()),
                    id: raw.id,
                    kind,
                }
            })
            .collect()
    }
}

/// `scheme://authority` of a gateway URL, plus the bare authority.
fn gateway_origin(url: &str) -> Result<(String, String)> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid gateway URL {url}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("gateway URL {url} has no host"))?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok((format!("{}://{authority}", parsed.scheme()), authority))
}

/// Client for the cloud endpoints.
#[derive(Debug)]
pub struct CloudAccess {
    settings: CloudSettings,
    http: reqwest::Client,
    config: Mutex<Option<AccessConfig>>,
    credentials: Mutex<Option<SessionCredentials>>,
}

impl CloudAccess {
    /// Create a client with its own cookie store.
    pub fn new(settings: CloudSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            settings,
            http,
            config: Mutex::new(None),
            credentials: Mutex::new(None),
        })
    }

    /// Sign in with user name and password.
    pub async fn login(&self, user: &str, password: &str) -> Result<LoginOutcome> {
        let url = format!("{}/api/sso/v1/login", self.settings.sso_base_url);
        let response = self
            .http
            .post(&url)
            .header("accept", ACCEPT_JSON)
            .json(&serde_json::json!({ "user": user, "password": password }))
            .send()
            .await
            .context("Failed to reach SSO login")?;

        let status = response.status();
        if status.as_u16() == MFA_REQUIRED {
            let challenge: MfaChallenge = response.json().await.context("Invalid MFA challenge")?;
            if challenge.required.as_deref() == Some("2fa") {
                let factors = challenge.factors();
                log::info!("[Cloud] Second factor required ({} offered)", factors.len());
                return Ok(LoginOutcome::MfaRequired(factors));
            }
            bail!("Login failed with {status}: unsupported challenge {:?}", challenge.required);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Login failed with {status}: {body}");
        }

        log::info!("[Cloud] Signed in as {user}");
        Ok(LoginOutcome::Authenticated)
    }

    /// Complete a login with a second-factor token.
    pub async fn verify_mfa(&self, token: &str) -> Result<()> {
        let url = format!("{}/api/sso/v1/login/2fa", self.settings.sso_base_url);
        let response = self
            .http
            .post(&url)
            .header("accept", ACCEPT_JSON)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("Failed to reach SSO 2FA endpoint")?;

        if response.status() != reqwest::StatusCode::OK {
            bail!("2FA token was rejected by the server ({})", response.status());
        }
        log::info!("[Cloud] Second factor accepted");
        Ok(())
    }

    /// Refresh the SSO token cookie.
    pub async fn refresh_token(&self) -> Result<()> {
        let url = format!("{}/api/sso/v1/jwt/token", self.settings.sso_base_url);
        self.http
            .get(&url)
            .header("accept", ACCEPT_JSON)
            .send()
            .await
            .context("Failed to refresh SSO token")?
            .error_for_status()
            .context("SSO token refresh rejected")?;
        Ok(())
    }

    /// The cloud access configuration, fetched once.
    pub async fn access_config(&self) -> Result<AccessConfig> {
        let mut cached = self.config.lock().await;
        if let Some(config) = cached.as_ref() {
            return Ok(config.clone());
        }

        let config: AccessConfig = self
            .http
            .get(&self.settings.access_config_url)
            .header("accept", ACCEPT_JSON)
            .send()
            .await
            .context("Failed to fetch cloud access config")?
            .error_for_status()
            .context("Cloud access config unavailable")?
            .json()
            .await
            .context("Invalid cloud access config")?;

        log::debug!("[Cloud] Broker host {}", config.unifi_cloud_access.iot.host);
        *cached = Some(config.clone());
        Ok(config)
    }

    /// Session credentials, created once per client.
    pub async fn credentials(&self) -> Result<SessionCredentials> {
        let mut cached = self.credentials.lock().await;
        if let Some(credentials) = cached.as_ref() {
            return Ok(credentials.clone());
        }

        let config = self.access_config().await?;
        let (origin, _) = gateway_origin(&config.unifi_cloud_access.api_gateway_ui.url)?;
        let mut credentials: SessionCredentials = self
            .http
            .post(format!("{origin}/create-credentials"))
            .header("accept", "*/*")
            .json(&serde_json::json!({ "withTurn": true }))
            .send()
            .await
            .context("Failed to request session credentials")?
            .error_for_status()
            .context("Session credentials rejected")?
            .json()
            .await
            .context("Invalid session credentials")?;

        credentials.turn_credentials.uris = filter_turn_uris(&credentials.turn_credentials.uris);
        log::info!(
            "[Cloud] Session credentials for identity {} ({} TURN URIs)",
            credentials.identity_id,
            credentials.turn_credentials.uris.len()
        );
        *cached = Some(credentials.clone());
        Ok(credentials)
    }

    /// Consoles registered with the signed-in account.
    pub async fn devices(&self) -> Result<Vec<CloudDeviceEntry>> {
        if let Err(e) = self.refresh_token().await {
            log::warn!("[Cloud] {e:#}");
        }

        let credentials = self.credentials().await?;
        let config = self.access_config().await?;
        let (origin, authority) = gateway_origin(&config.unifi_cloud_access.api_gateway.url)?;

        let request = CanonicalRequest::new(
            AuthMode::Header,
            authority,
            credentials.access_key_id.as_str(),
            credentials.region.as_str(),
            API_GATEWAY_SERVICE,
        )
        .with_path("/devices")
        .with_query_string("type=ucore&withUserData=true")
        .with_session_token(Some(credentials.session_token.clone()));

        let url = format!("{origin}/devices?{}", request.signing_query().render());
        let mut builder = self.http.get(&url).header("accept", ACCEPT_JSON);
        for (name, value) in sigv4::signed_headers(&request, &credentials.secret_key)? {
            builder = builder.header(name, value);
        }

        let devices: Vec<CloudDeviceEntry> = builder
            .send()
            .await
            .context("Failed to list devices")?
            .error_for_status()
            .context("Device list rejected")?
            .json()
            .await
            .context("Invalid device list")?;

        log::info!("[Cloud] {} device(s) registered", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials_json() -> serde_json::Value {
        serde_json::json!({
            "accessKeyId": "ASIAEXAMPLE",
            "secretKey": "secret",
            "sessionToken": "token/with+chars=",
            "region": "us-east-1",
            "identityId": "us-east-1:identity",
            "turnCredentials": {
                "username": "turn-user",
                "password": "turn-pass",
                "uris": [
                    "stun:turn.example.com:3478",
                    "turn:turn.example.com:3478?transport=udp",
                    "turn:turn.example.com:3478?transport=tcp",
                    "turns:turn.example.com:443?transport=tcp"
                ]
            }
        })
    }

    async fn cloud(server: &MockServer) -> CloudAccess {
        Mock::given(method("GET"))
            .and(path("/cloudAccessConfig.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "unifiCloudAccess": {
                    "iot": { "host": "iot.example.com" },
                    "apiGateway": { "url": format!("{}/api", server.uri()) },
                    "apiGatewayUI": { "url": format!("{}/ui", server.uri()) }
                }
            })))
            .expect(1)
            .mount(server)
            .await;

        CloudAccess::new(CloudSettings {
            access_config_url: format!("{}/cloudAccessConfig.json", server.uri()),
            sso_base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_filter_turn_uris() {
        let uris = vec![
            "stun:a:3478".to_string(),
            "turn:a:3478?transport=udp".to_string(),
            "turn:a:3478?transport=tcp".to_string(),
            "turns:a:443?transport=tcp".to_string(),
        ];
        assert_eq!(
            filter_turn_uris(&uris),
            vec!["turn:a:3478?transport=udp".to_string(), "turns:a:443?transport=tcp".to_string()]
        );
    }

    #[test]
    fn test_gateway_origin_keeps_port() {
        assert_eq!(
            gateway_origin("https://gw.example.com/prod").unwrap(),
            ("https://gw.example.com".to_string(), "gw.example.com".to_string())
        );
        assert_eq!(
            gateway_origin("http://127.0.0.1:8080/x").unwrap(),
            ("http://127.0.0.1:8080".to_string(), "127.0.0.1:8080".to_string())
        );
        assert!(gateway_origin("not a url").is_err());
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials: SessionCredentials = serde_json::from_value(credentials_json()).unwrap();
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("token/with"));
        assert!(!debug.contains("turn-pass"));
        assert!(debug.contains("ASIAEXAMPLE"));
    }

    #[tokio::test]
    async fn test_login_without_mfa() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sso/v1/login"))
            .and(body_json(serde_json::json!({"user": "admin", "password": "pw"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let cloud = CloudAccess::new(CloudSettings {
            sso_base_url: server.uri(),
            ..CloudSettings::default()
        })
        .unwrap();
        assert_eq!(cloud.login("admin", "pw").await.unwrap(), LoginOutcome::Authenticated);
    }

    #[tokio::test]
    async fn test_login_requiring_mfa_lists_factors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sso/v1/login"))
            .respond_with(ResponseTemplate::new(499).set_body_json(serde_json::json!({
                "required": "2fa",
                "user": { "default_mfa": "f2" },
                "authenticators": [
                    { "id": "f1", "type": "totp" },
                    { "id": "f2", "type": "email", "email": "a***@example.com" }
                ]
            })))
            .mount(&server)
            .await;

        let cloud = CloudAccess::new(CloudSettings {
            sso_base_url: server.uri(),
            ..CloudSettings::default()
        })
        .unwrap();
        let LoginOutcome::MfaRequired(factors) = cloud.login("admin", "pw").await.unwrap() else {
            panic!("expected MFA challenge");
        };
        assert_eq!(factors.len(), 2);
        assert_eq!(factors[0].kind, MfaKind::Other("totp".to_string()));
        assert!(!factors[0].preferred);
        assert!(factors[1].preferred);
        assert_eq!(factors[1].description(), "Email authorization via a***@example.com");
    }

    #[tokio::test]
    async fn test_login_with_bad_password_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sso/v1/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let cloud = CloudAccess::new(CloudSettings {
            sso_base_url: server.uri(),
            ..CloudSettings::default()
        })
        .unwrap();
        let err = cloud.login("admin", "wrong").await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }

    #[tokio::test]
    async fn test_rejected_mfa_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/sso/v1/login/2fa"))
            .and(body_json(serde_json::json!({"token": "123456"})))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let cloud = CloudAccess::new(CloudSettings {
            sso_base_url: server.uri(),
            ..CloudSettings::default()
        })
        .unwrap();
        let err = cloud.verify_mfa("123456").await.unwrap_err();
        assert!(err.to_string().contains("rejected"), "{err}");
    }

    #[tokio::test]
    async fn test_credentials_are_filtered_and_cached() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        Mock::given(method("POST"))
            .and(path("/create-credentials"))
            .and(body_json(serde_json::json!({"withTurn": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(credentials_json()))
            .expect(1)
            .mount(&server)
            .await;

        let first = cloud.credentials().await.unwrap();
        let second = cloud.credentials().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.turn_credentials.uris,
            vec![
                "turn:turn.example.com:3478?transport=udp".to_string(),
                "turns:turn.example.com:443?transport=tcp".to_string()
            ]
        );

        let ice = first.ice_servers();
        assert_eq!(ice.len(), 1);
        assert_eq!(ice[0].username.as_deref(), Some("turn-user"));
        assert_eq!(ice[0].credential.as_deref(), Some("turn-pass"));
    }

    #[tokio::test]
    async fn test_devices_uses_signed_headers() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        Mock::given(method("POST"))
            .and(path("/create-credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(credentials_json()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/sso/v1/jwt/token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .and(query_param("type", "ucore"))
            .and(query_param("withUserData", "true"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .and(header("x-amz-security-token", "token/with+chars="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": "console-1", "type": "ucore", "online": true }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let devices = cloud.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "console-1");
        assert_eq!(devices[0].details["online"], true);

        let requests = server.received_requests().await.unwrap();
        let listing = requests.iter().find(|r| r.url.path() == "/devices").unwrap();
        let authorization = listing.headers.get("authorization").unwrap().to_str().unwrap();
        assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=ASIAEXAMPLE/"));
        assert!(authorization.contains("/us-east-1/execute-api/aws4_request"));
        assert!(authorization.contains("SignedHeaders=host;x-amz-date;x-amz-security-token"));
    }

    #[tokio::test]
    async fn test_device_listing_survives_failed_token_refresh() {
        let server = MockServer::start().await;
        let cloud = cloud(&server).await;
        Mock::given(method("POST"))
            .and(path("/create-credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(credentials_json()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        assert!(cloud.devices().await.unwrap().is_empty());
    }
}
