//! Credential source for tests that rotates tokens on re-authorization

use crate::{BearerToken, CredentialError, CredentialSource};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Token that can be rotated by re-authorization
#[derive(Debug)]
pub struct TestCredentials {
    tokens: Mutex<(String, VecDeque<String>)>,
    reauthorizations: AtomicUsize,
}

impl TestCredentials {
    pub fn new(token: &str) -> Arc<Self> {
        Self::rotating(token, &[])
    }

    /// Each re-authorization switches to the next token; none left declines
    pub fn rotating(token: &str, next: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new((
                token.to_string(),
                next.iter().map(|t| t.to_string()).collect(),
            )),
            reauthorizations: AtomicUsize::new(0),
        })
    }

    pub fn reauthorizations(&self) -> usize {
        self.reauthorizations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for TestCredentials {
    async fn access_token(&self) -> Result<BearerToken, CredentialError> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(BearerToken::new(tokens.0.clone()))
    }

    async fn reauthorize(&self) -> Result<bool, CredentialError> {
        self.reauthorizations.fetch_add(1, Ordering::SeqCst);
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.1.pop_front() {
            Some(token) => {
                tokens.0 = token;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
