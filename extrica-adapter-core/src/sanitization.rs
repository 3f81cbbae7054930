use http::{HeaderMap, HeaderName, HeaderValue, header};

/// Headers that carry credentials. Profiles may add any of them as extra headers.
const CREDENTIAL_HEADERS: [HeaderName; 4] = [
    header::AUTHORIZATION,
    header::PROXY_AUTHORIZATION,
    header::COOKIE,
    HeaderName::from_static("x-trino-extra-credential"),
];

/// Safe to log representation of a value.
pub trait Sanitize {
    fn sanitize(&self) -> Self;
}

impl Sanitize for HeaderMap {
    /// Replaces every credential header, as well as every value marked as sensitive.
    fn sanitize(&self) -> Self {
        let mut sanitized = self.clone();
        for (name, value) in sanitized.iter_mut() {
            if value.is_sensitive() || CREDENTIAL_HEADERS.contains(name) {
                *value = HeaderValue::from_static("<redacted>");
            }
        }
        sanitized
    }
}
