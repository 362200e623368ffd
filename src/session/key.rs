use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Bearer token produced by `bw unlock`.
///
/// Zeroed on drop; `Debug` never shows the value.
pub struct SessionKey(SecretString);

impl SessionKey {
    pub fn new(raw: String) -> Self {
        Self(SecretString::from(raw))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SessionKey {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_owned())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}
