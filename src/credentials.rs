use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::CredentialsConfig;
use crate::error::ProxyError;

/// Credentials selected for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub index: usize,
    pub auth_token: String,
    pub cookie: String,
}

/// Round-robin selector over the token and cookie pools.
///
/// Both pools are indexed by the same counter but wrap independently, so a
/// token is not tied to any particular cookie.
#[derive(Debug, Clone)]
pub struct CredentialRotator {
    tokens: Arc<Vec<String>>,
    cookies: Arc<Vec<String>>,
    next: Arc<AtomicUsize>,
}

impl CredentialRotator {
    pub fn new(tokens: Vec<String>, cookies: Vec<String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
            cookies: Arc::new(cookies),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(cfg: &CredentialsConfig) -> Self {
        Self::new(cfg.auth_tokens.clone(), cfg.cookies.clone())
    }

    pub fn is_configured(&self) -> bool {
        !self.tokens.is_empty() && !self.cookies.is_empty()
    }

    pub fn pool_sizes(&self) -> (usize, usize) {
        (self.tokens.len(), self.cookies.len())
    }

    /// Pick the next pair. Empty pools are a configuration error and do not
    /// advance the counter.
    pub fn next(&self) -> Result<CredentialPair, ProxyError> {
        if !self.is_configured() {
            return Err(ProxyError::Configuration(
                "SENSE_API_KEYS_STR or SENSE_COOKIES_STR is not configured.".to_string(),
            ));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(CredentialPair {
            index,
            auth_token: self.tokens[index % self.tokens.len()].clone(),
            cookie: self.cookies[index % self.cookies.len()].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn pool(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn rotation_wraps_each_pool_independently() {
        for m in 1..=4 {
            for n in 1..=4 {
                let rot = CredentialRotator::new(pool("t", m), pool("c", n));
                for k in 1..=10usize {
                    let pair = rot.next().expect("configured");
                    assert_eq!(pair.index, k - 1);
                    assert_eq!(pair.auth_token, format!("t{}", (k - 1) % m));
                    assert_eq!(pair.cookie, format!("c{}", (k - 1) % n));
                }
            }
        }
    }

    #[test]
    fn empty_pool_is_configuration_error() {
        let rot = CredentialRotator::new(pool("t", 2), Vec::new());
        let err = rot.next().expect_err("cookies missing");
        assert!(matches!(err, ProxyError::Configuration(_)));

        let rot = CredentialRotator::new(Vec::new(), pool("c", 1));
        assert!(rot.next().is_err());
    }

    #[test]
    fn clones_share_the_counter() {
        let a = CredentialRotator::new(pool("t", 3), pool("c", 3));
        let b = a.clone();
        assert_eq!(a.next().expect("pair").index, 0);
        assert_eq!(b.next().expect("pair").index, 1);
        assert_eq!(a.next().expect("pair").auth_token, "t2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_share_an_index() {
        let rot = CredentialRotator::new(pool("t", 5), pool("c", 7));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rot = rot.clone();
            handles.push(tokio::spawn(async move {
                (0..50)
                    .map(|_| rot.next().expect("pair").index)
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.extend(h.await.expect("join"));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<_>>());
    }
}
