//! Obtains bearer tokens by signing in to the engine's identity service and keeps the
//! current one until it is about to expire.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::{StatusCode, blocking::Client};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Tokens are refreshed this long before they actually expire.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(2 * 60);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to construct HTTP client for sign-in"))]
    ConstructHttpClient { source: reqwest::Error },

    #[snafu(display("Failed to construct sign-in endpoint for host {host:?}"))]
    ParseSignInEndpoint {
        source: url::ParseError,
        host: String,
    },

    #[snafu(display("Failed to send sign-in request to {endpoint}"))]
    SendSignIn {
        source: reqwest::Error,
        endpoint: Url,
    },

    #[snafu(display("Sign-in at {endpoint} was rejected with HTTP status {status}: {body}"))]
    SignInRejected {
        endpoint: Url,
        status: StatusCode,
        body: String,
    },

    #[snafu(display("Failed to parse sign-in response from {endpoint}"))]
    ParseSignInResponse {
        source: reqwest::Error,
        endpoint: Url,
    },

    #[snafu(display("The issued token is not a JWT, as it has no claims part"))]
    MalformedToken,

    #[snafu(display("Failed to decode the claims of the issued token"))]
    DecodeTokenClaims { source: base64::DecodeError },

    #[snafu(display("Failed to parse the claims of the issued token"))]
    ParseTokenClaims { source: serde_json::Error },

    #[snafu(display("The issued token has an invalid expiry {exp}"))]
    InvalidExpiry { exp: f64 },
}

/// What is needed to sign in for a new token.
#[derive(Clone, PartialEq, Eq)]
pub struct SignInCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Debug for SignInCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignInCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Issues new access tokens.
pub trait TokenIssuer: Send + Sync {
    fn sign_in(&self, credentials: &SignInCredentials) -> Result<String, Error>;
}

#[derive(Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    access_token: String,
}

/// Signs in at `https://{host}/iam/security/signin`.
pub struct HttpTokenIssuer {
    http_client: Client,
}

impl HttpTokenIssuer {
    pub fn new() -> Result<Self, Error> {
        let http_client = Client::builder()
            .user_agent(format!("dbt-extrica-{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context(ConstructHttpClientSnafu)?;

        Ok(Self { http_client })
    }
}

impl TokenIssuer for HttpTokenIssuer {
    #[instrument(skip(self))]
    fn sign_in(&self, credentials: &SignInCredentials) -> Result<String, Error> {
        let endpoint = Url::parse(&format!("https://{}/iam/security/signin", credentials.host))
            .context(ParseSignInEndpointSnafu {
                host: &credentials.host,
            })?;

        let response = self
            .http_client
            .post(endpoint.clone())
            .json(&SignInRequest {
                email: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .context(SendSignInSnafu {
                endpoint: endpoint.clone(),
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().unwrap_or_default();
            warn!(%endpoint, %status, %body, "Sign-in was rejected");
            return SignInRejectedSnafu {
                endpoint,
                status,
                body,
            }
            .fail();
        }

        let response: SignInResponse = response
            .json()
            .context(ParseSignInResponseSnafu { endpoint })?;
        Ok(response.access_token)
    }
}

struct CachedToken {
    token: String,
    expiry: SystemTime,
    host: String,
    username: String,
}

impl CachedToken {
    fn usable_for(&self, credentials: &SignInCredentials, leeway: Duration) -> bool {
        self.host == credentials.host
            && self.username == credentials.username
            && self
                .expiry
                .checked_sub(leeway)
                .is_some_and(|refresh_at| SystemTime::now() <= refresh_at)
    }
}

/// Holds a single token that is shared by all connections of the process.
///
/// The lock is held while signing in, so concurrent callers hitting an expired token wait
/// for the one refresh in flight and all get its token.
pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    leeway: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self::with_leeway(issuer, DEFAULT_LEEWAY)
    }

    pub fn with_leeway(issuer: Arc<dyn TokenIssuer>, leeway: Duration) -> Self {
        Self {
            issuer,
            leeway,
            cached: Mutex::new(None),
        }
    }

    /// A cache signing in over HTTP.
    pub fn http() -> Result<Self, Error> {
        Ok(Self::new(Arc::new(HttpTokenIssuer::new()?)))
    }

    /// Returns the cached token, signing in first if there is none or it is about to
    /// expire. A failed sign-in leaves the cache empty.
    #[instrument(skip(self))]
    pub fn get_token(&self, credentials: &SignInCredentials) -> Result<String, Error> {
        // A panic during sign-in can not leave a half-written token behind
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(token) = cached
            .as_ref()
            .filter(|token| token.usable_for(credentials, self.leeway))
        {
            debug!("Using cached token");
            return Ok(token.token.clone());
        }

        *cached = None;
        let token = self.issuer.sign_in(credentials)?;
        let expiry = token_expiry(&token)?;
        info!(
            host = %credentials.host,
            username = %credentials.username,
            ?expiry,
            "Obtained new access token"
        );

        *cached = Some(CachedToken {
            token: token.clone(),
            expiry,
            host: credentials.host.clone(),
            username: credentials.username.clone(),
        });
        Ok(token)
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: f64,
}

/// Reads the `exp` claim of a JWT.
///
/// The signature is NOT verified. The expiry is only used to schedule refreshes and must
/// never be used to decide whether the token can be trusted.
pub fn token_expiry(token: &str) -> Result<SystemTime, Error> {
    let mut parts = token.split('.');
    let payload = parts
        .nth(1)
        .filter(|payload| !payload.is_empty())
        .context(MalformedTokenSnafu)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context(DecodeTokenClaimsSnafu)?;
    let claims: Claims = serde_json::from_slice(&payload).context(ParseTokenClaimsSnafu)?;

    let exp = Duration::try_from_secs_f64(claims.exp)
        .ok()
        .context(InvalidExpirySnafu { exp: claims.exp })?;
    UNIX_EPOCH
        .checked_add(exp)
        .context(InvalidExpirySnafu { exp: claims.exp })
}
