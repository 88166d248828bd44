//! Scoped bearer tokens: `subject|expiry|scope`, with a runtime revocation set.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::protocol::Scope;

/// Validation attempts kept for inspection.
pub const VALIDATION_LOG_CAPACITY: usize = 100;

/// Parsed token fields. `scope` stays raw so unknown scopes surface as mismatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub subject: String,
    pub expiry: u64,
    pub scope: String,
}

impl Token {
    /// Structural parse only: three fields and an integer expiry.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let mut parts = raw.split('|');
        let (Some(subject), Some(expiry), Some(scope), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::MalformedToken);
        };
        let expiry = expiry
            .trim()
            .parse::<u64>()
            .map_err(|_| TokenError::MalformedExpiry)?;
        Ok(Token {
            subject: subject.to_string(),
            expiry,
            scope: scope.to_string(),
        })
    }

    /// Host part of an `name@host` subject.
    pub fn subject_host(&self) -> Option<&str> {
        self.subject.rsplit_once('@').map(|(_, host)| host)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.subject, self.expiry, self.scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    MalformedToken,
    #[error("malformed token expiry")]
    MalformedExpiry,
    #[error("token expired")]
    Expired,
    #[error("token scope does not match")]
    ScopeMismatch,
    #[error("token revoked")]
    Revoked,
    #[error("token subject does not match sender address")]
    IdentityMismatch,
}

/// One logged validation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord {
    pub at_secs: u64,
    pub subject: Option<String>,
    pub required_scope: Scope,
    pub error: Option<TokenError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenStats {
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub success_rate: f64,
}

pub struct TokenAuthority {
    clock: Arc<dyn Clock>,
    revoked: HashSet<String>,
    log: VecDeque<ValidationRecord>,
    total: u64,
    valid: u64,
}

impl TokenAuthority {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            revoked: HashSet::new(),
            log: VecDeque::with_capacity(VALIDATION_LOG_CAPACITY),
            total: 0,
            valid: 0,
        }
    }

    pub fn mint(&self, subject: &str, ttl_secs: u64, scope: Scope) -> String {
        let expiry = self.clock.now_secs().saturating_add(ttl_secs);
        Token {
            subject: subject.to_string(),
            expiry,
            scope: scope.as_str().to_string(),
        }
        .to_string()
    }

    /// Run every check in order without recording anything.
    pub fn check(
        &self,
        raw: &str,
        required: Scope,
        sender_ip: Option<IpAddr>,
    ) -> Result<Token, TokenError> {
        let token = Token::parse(raw)?;
        if token.expiry <= self.clock.now_secs() {
            return Err(TokenError::Expired);
        }
        if token.scope != required.as_str() {
            return Err(TokenError::ScopeMismatch);
        }
        if self.revoked.contains(raw) {
            return Err(TokenError::Revoked);
        }
        if let (Some(ip), Some(host)) = (sender_ip, token.subject_host()) {
            if host != ip.to_string() {
                return Err(TokenError::IdentityMismatch);
            }
        }
        Ok(token)
    }

    /// [`TokenAuthority::check`] plus an entry in the validation log and statistics.
    pub fn validate(
        &mut self,
        raw: &str,
        required: Scope,
        sender_ip: Option<IpAddr>,
    ) -> Result<Token, TokenError> {
        let result = self.check(raw, required, sender_ip);
        self.total += 1;
        if result.is_ok() {
            self.valid += 1;
        } else {
            debug!(token = raw, scope = %required, error = ?result.as_ref().err(), "token rejected");
        }
        if self.log.len() == VALIDATION_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(ValidationRecord {
            at_secs: self.clock.now_secs(),
            subject: raw.split('|').next().map(str::to_string),
            required_scope: required,
            error: result.as_ref().err().copied(),
        });
        result
    }

    /// Returns true when the token was not already revoked.
    pub fn revoke(&mut self, raw: &str) -> bool {
        self.revoked.insert(raw.to_string())
    }

    pub fn is_revoked(&self, raw: &str) -> bool {
        self.revoked.contains(raw)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }

    pub fn stats(&self) -> TokenStats {
        let invalid = self.total - self.valid;
        let success_rate = if self.total == 0 {
            0.0
        } else {
            self.valid as f64 / self.total as f64
        };
        TokenStats {
            total: self.total,
            valid: self.valid,
            invalid,
            success_rate,
        }
    }

    /// Snapshot of the most recent validation attempts, oldest first.
    pub fn recent_validations(&self) -> Vec<ValidationRecord> {
        self.log.iter().cloned().collect()
    }
}
