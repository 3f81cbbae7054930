use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use extrica_adapter_core::credentials::{AuthMethod, Credentials};

use crate::token_cache::{self, SignInCredentials, TokenCache};

#[enum_dispatch(Authentication)]
pub trait Authenticate {
    /// The bearer token the driver connection presents to the engine.
    fn bearer_token(&self) -> Result<String, token_cache::Error>;
}

/// The authentication strategy of a target, chosen once its credentials are resolved.
#[enum_dispatch]
pub enum Authentication {
    SignIn(SignInAuthentication),
    StaticToken(StaticTokenAuthentication),
}

impl Authentication {
    pub fn for_credentials(credentials: &Credentials, token_cache: &Arc<TokenCache>) -> Self {
        match credentials.auth() {
            AuthMethod::SignIn { username, password } => SignInAuthentication {
                credentials: SignInCredentials {
                    host: credentials.host().to_owned(),
                    username: username.clone(),
                    password: password.clone(),
                },
                token_cache: Arc::clone(token_cache),
            }
            .into(),
            AuthMethod::StaticToken { token } => StaticTokenAuthentication {
                token: token.clone(),
            }
            .into(),
        }
    }
}

/// Signs in with username and password, sharing the resulting token through the cache.
pub struct SignInAuthentication {
    credentials: SignInCredentials,
    token_cache: Arc<TokenCache>,
}

impl Authenticate for SignInAuthentication {
    fn bearer_token(&self) -> Result<String, token_cache::Error> {
        self.token_cache.get_token(&self.credentials)
    }
}

pub struct StaticTokenAuthentication {
    token: String,
}

impl Authenticate for StaticTokenAuthentication {
    fn bearer_token(&self) -> Result<String, token_cache::Error> {
        Ok(self.token.clone())
    }
}
