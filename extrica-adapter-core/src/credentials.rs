use std::{collections::BTreeMap, fmt::Debug, path::PathBuf};

use http::HeaderMap;
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};
use strum::Display;
use tracing::instrument;

use crate::{ADAPTER_TYPE, sanitization::Sanitize};

/// Default number of attempts the engine client makes for a single request.
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_PREPARED_STATEMENTS_ENABLED: bool = true;

const SUPPORTED_METHOD: &str = "jwt";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to parse credentials"))]
    ParseCredentials { source: serde_yaml::Error },

    #[snafu(display("The profile is of type {adapter_type:?}, but only {ADAPTER_TYPE:?} is supported"))]
    UnsupportedAdapterType { adapter_type: String },

    #[snafu(display(
        "The authentication method {method:?} is not supported, only {SUPPORTED_METHOD:?} is"
    ))]
    UnsupportedMethod { method: String },

    #[snafu(display("The credential field {field:?} is invalid: {reason}"))]
    InvalidField { field: String, reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HttpScheme {
    Http,
    #[default]
    Https,
}

/// The connection parameters exactly as the user wrote them into the profile.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCredentials {
    #[serde(rename = "type")]
    pub adapter_type: Option<String>,
    pub method: Option<String>,
    /// Only used by the calling tool to size its worker pool.
    pub threads: Option<u32>,

    pub host: String,
    pub port: u16,
    #[serde(alias = "catalog")]
    pub database: String,
    pub schema: String,

    pub username: String,
    pub password: String,
    pub jwt_token: Option<String>,
    /// Accepted for compatibility with existing profiles, a new token is always obtained
    /// by signing in again.
    pub refresh_token: Option<String>,

    pub user: Option<String>,
    pub impersonation_user: Option<String>,
    #[serde(default)]
    pub client_tags: Vec<String>,
    #[serde(default)]
    pub roles: BTreeMap<String, String>,

    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub http_scheme: HttpScheme,
    #[serde(default, with = "http_serde::header_map")]
    pub http_headers: HeaderMap,
    #[serde(default)]
    pub session_properties: BTreeMap<String, serde_json::Value>,

    #[serde(default = "default_prepared_statements_enabled")]
    pub prepared_statements_enabled: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    pub timezone: Option<String>,
}

fn default_prepared_statements_enabled() -> bool {
    DEFAULT_PREPARED_STATEMENTS_ENABLED
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// How a connection proves its identity to the engine.
///
/// Every variant ends up presenting a bearer token, they only differ in where the token
/// comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Sign in with username and password to obtain a short-lived token.
    SignIn { username: String, password: String },

    /// A token issued up front, which is passed along as-is.
    StaticToken { token: String },
}

impl Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::SignIn { username, .. } => f
                .debug_struct("SignIn")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::StaticToken { .. } => f
                .debug_struct("StaticToken")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Validated connection parameters of a single target. Can not be changed once resolved.
#[derive(Clone)]
pub struct Credentials {
    host: String,
    port: u16,
    database: String,
    schema: String,
    username: String,
    auth: AuthMethod,
    user: Option<String>,
    client_tags: Vec<String>,
    roles: BTreeMap<String, String>,
    cert: Option<PathBuf>,
    http_scheme: HttpScheme,
    http_headers: HeaderMap,
    session_properties: BTreeMap<String, serde_json::Value>,
    prepared_statements_enabled: bool,
    retries: u32,
    timezone: Option<String>,
}

impl Credentials {
    /// Parses and validates the raw connection parameters of a target.
    #[instrument(skip(raw))]
    pub fn resolve(raw: serde_yaml::Value) -> Result<Self, Error> {
        let raw: RawCredentials = serde_yaml::from_value(raw).context(ParseCredentialsSnafu)?;
        Self::try_from(raw)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The catalog new connections use by default.
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }

    /// The user queries are run as. When not set, the engine uses the principal of the token.
    pub fn session_user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn client_tags(&self) -> &[String] {
        &self.client_tags
    }

    pub fn roles(&self) -> &BTreeMap<String, String> {
        &self.roles
    }

    pub fn cert(&self) -> Option<&PathBuf> {
        self.cert.as_ref()
    }

    pub fn http_scheme(&self) -> HttpScheme {
        self.http_scheme
    }

    pub fn http_headers(&self) -> &HeaderMap {
        &self.http_headers
    }

    pub fn session_properties(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.session_properties
    }

    pub fn prepared_statements_enabled(&self) -> bool {
        self.prepared_statements_enabled
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn timezone(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn method(&self) -> &'static str {
        SUPPORTED_METHOD
    }

    /// The field that identifies the target the credentials point to.
    pub fn unique_field(&self) -> &str {
        &self.host
    }

    /// The connection parameters that are safe to show to the user, in display order.
    pub fn connection_info(&self) -> Vec<(&'static str, String)> {
        vec![
            ("method", self.method().to_owned()),
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("username", self.username.clone()),
            ("database", self.database.clone()),
            ("schema", self.schema.clone()),
            (
                "cert",
                self.cert
                    .as_ref()
                    .map(|cert| cert.display().to_string())
                    .unwrap_or_default(),
            ),
            (
                "prepared_statements_enabled",
                self.prepared_statements_enabled.to_string(),
            ),
        ]
    }
}

impl TryFrom<RawCredentials> for Credentials {
    type Error = Error;

    fn try_from(raw: RawCredentials) -> Result<Self, Self::Error> {
        if let Some(adapter_type) = raw.adapter_type {
            ensure!(
                adapter_type == ADAPTER_TYPE,
                UnsupportedAdapterTypeSnafu { adapter_type }
            );
        }
        if let Some(method) = raw.method {
            ensure!(method == SUPPORTED_METHOD, UnsupportedMethodSnafu { method });
        }

        ensure_not_empty("host", &raw.host)?;
        ensure!(
            !raw.host.contains("://") && !raw.host.contains('/'),
            InvalidFieldSnafu {
                field: "host",
                reason: "it must be a plain hostname without scheme or path",
            }
        );
        ensure!(
            raw.port != 0,
            InvalidFieldSnafu {
                field: "port",
                reason: "it must not be 0",
            }
        );
        ensure!(
            raw.retries >= 1,
            InvalidFieldSnafu {
                field: "retries",
                reason: "at least one attempt is needed",
            }
        );

        let auth = match raw.jwt_token.filter(|token| !token.is_empty()) {
            Some(token) => AuthMethod::StaticToken { token },
            None => {
                ensure_not_empty("username", &raw.username)?;
                ensure_not_empty("password", &raw.password)?;
                AuthMethod::SignIn {
                    username: raw.username.clone(),
                    password: raw.password,
                }
            }
        };

        Ok(Self {
            host: raw.host,
            port: raw.port,
            database: raw.database,
            schema: raw.schema,
            username: raw.username,
            auth,
            user: raw.impersonation_user.or(raw.user),
            client_tags: raw.client_tags,
            roles: raw.roles,
            cert: raw.cert,
            http_scheme: raw.http_scheme,
            http_headers: raw.http_headers,
            session_properties: raw.session_properties,
            prepared_statements_enabled: raw.prepared_statements_enabled,
            retries: raw.retries,
            timezone: raw.timezone,
        })
    }
}

fn ensure_not_empty(field: &str, value: &str) -> Result<(), Error> {
    ensure!(
        !value.trim().is_empty(),
        InvalidFieldSnafu {
            field,
            reason: "it must not be empty",
        }
    );
    Ok(())
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("user", &self.user)
            .field("client_tags", &self.client_tags)
            .field("roles", &self.roles)
            .field("cert", &self.cert)
            .field("http_scheme", &self.http_scheme)
            .field("http_headers", &self.http_headers.sanitize())
            .field("session_properties", &self.session_properties)
            .field(
                "prepared_statements_enabled",
                &self.prepared_statements_enabled,
            )
            .field("retries", &self.retries)
            .field("timezone", &self.timezone)
            .finish()
    }
}
