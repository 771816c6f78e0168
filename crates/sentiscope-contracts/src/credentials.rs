use std::env;
use std::fmt;

use crate::errors::PipelineError;

/// Highest numbered `GEMINI_API_KEY<n>` slot scanned by [`CredentialPool::from_env`].
pub const MAX_CREDENTIAL_SLOTS: usize = 16;

const NUMBERED_KEY_PREFIX: &str = "GEMINI_API_KEY";
const FALLBACK_KEYS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

/// One access token plus the name it was loaded under.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    label: String,
    secret: String,
}

impl Credential {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Fixed, ordered set of credentials with a cursor that wraps around.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    index: usize,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self, PipelineError> {
        if credentials.is_empty() {
            return Err(PipelineError::StartupConfig(
                "no API credentials configured".to_string(),
            ));
        }
        Ok(Self {
            credentials,
            index: 0,
        })
    }

    /// Loads `GEMINI_API_KEY1..=GEMINI_API_KEY16`, skipping unset or blank
    /// slots. When none are set, a single `GEMINI_API_KEY` / `GOOGLE_API_KEY`
    /// is used instead.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| Credential::new(key, value))
        };

        let mut credentials = (1..=MAX_CREDENTIAL_SLOTS)
            .filter_map(|slot| read(&format!("{NUMBERED_KEY_PREFIX}{slot}")))
            .collect::<Vec<Credential>>();
        if credentials.is_empty() {
            credentials.extend(FALLBACK_KEYS.iter().find_map(|key| read(key)));
        }
        if credentials.is_empty() {
            return Err(PipelineError::StartupConfig(format!(
                "no valid API keys found; set {NUMBERED_KEY_PREFIX}1..{NUMBERED_KEY_PREFIX}{MAX_CREDENTIAL_SLOTS} or GEMINI_API_KEY"
            )));
        }
        Self::new(credentials)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &Credential {
        &self.credentials[self.index]
    }

    /// Advances to the next credential, wrapping to the first after the last.
    pub fn rotate(&mut self) -> &Credential {
        self.index = (self.index + 1) % self.credentials.len();
        self.current()
    }

    pub fn labels(&self) -> Vec<String> {
        self.credentials
            .iter()
            .map(|credential| credential.label.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Credential, CredentialPool};
    use crate::errors::PipelineError;

    fn pool(size: usize) -> CredentialPool {
        let credentials = (0..size)
            .map(|idx| Credential::new(format!("KEY{idx}"), format!("secret-{idx}")))
            .collect();
        CredentialPool::new(credentials).unwrap()
    }

    #[test]
    fn empty_pool_is_a_startup_error() {
        let err = CredentialPool::new(Vec::new()).unwrap_err();
        assert!(matches!(err, PipelineError::StartupConfig(_)));
    }

    #[test]
    fn rotation_is_cyclic_for_any_count() {
        for size in 1..=5 {
            let mut pool = pool(size);
            for k in 0..(size * 3 + 2) {
                assert_eq!(pool.index(), k % size);
                pool.rotate();
            }
        }
    }

    #[test]
    fn rotation_from_non_zero_start_wraps() {
        let mut pool = pool(3);
        pool.rotate();
        let start = pool.index();
        for k in 0..10 {
            assert_eq!(pool.index(), (start + k) % 3);
            assert!(pool.index() < pool.len());
            pool.rotate();
        }
    }

    #[test]
    fn from_lookup_skips_gaps_and_blank_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEY1", "one"),
            ("GEMINI_API_KEY2", "   "),
            ("GEMINI_API_KEY4", "four"),
            ("GEMINI_API_KEY", "ignored"),
        ]);
        let pool = CredentialPool::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(pool.labels(), vec!["GEMINI_API_KEY1", "GEMINI_API_KEY4"]);
        assert_eq!(pool.current().secret(), "one");
    }

    #[test]
    fn from_lookup_falls_back_to_single_key() {
        let env: HashMap<&str, &str> = HashMap::from([("GOOGLE_API_KEY", "g")]);
        let pool = CredentialPool::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.current().label(), "GOOGLE_API_KEY");
    }

    #[test]
    fn from_lookup_without_keys_fails_fast() {
        let err = CredentialPool::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains("no valid API keys found"));
    }

    #[test]
    fn debug_output_redacts_secret() {
        let credential = Credential::new("GEMINI_API_KEY1", "top-secret");
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("GEMINI_API_KEY1"));
        assert!(!rendered.contains("top-secret"));
    }
}
