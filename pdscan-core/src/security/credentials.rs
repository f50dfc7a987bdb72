//! Source credentials with automatic memory zeroing.
//!
//! Passwords live in `Zeroizing` containers from the moment they leave
//! [`crate::adapters::AdapterConfig`] until a driver's connect options have
//! been built, and are never shown by `Debug`.

use zeroize::{Zeroize, Zeroizing};

/// Username and optional password, cleared from memory on drop.
///
/// # Example
///
/// ```rust
/// use pdscan_core::security::Credentials;
///
/// let creds = Credentials::new("scanner".to_string(), Some("secret".to_string()));
/// assert_eq!(creds.username(), "scanner");
/// assert!(!format!("{:?}", creds).contains("secret"));
/// ```
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Credentials {
    username: Zeroizing<String>,
    password: Zeroizing<Option<String>>,
}

impl Credentials {
    pub fn new(username: String, password: Option<String>) -> Self {
        Self {
            username: Zeroizing::new(username),
            password: Zeroizing::new(password),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Borrowed password for handing to a driver's connect options.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &*self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}
