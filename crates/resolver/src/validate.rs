//! DNSSEC validator hook.
//!
//! The resolver reserves the integration surface but never performs
//! cryptographic validation itself: data under a security root is handed to
//! the injected validator together with its covering RRSIG, and the
//! validator's verdict decides whether the data is committed to the cache.

use crate::rdataset::Rdataset;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Proven unsigned; cache as-is.
    Insecure,
    /// Signature verified; cache as-is.
    Secure,
    /// Verification failed; do not cache.
    Bogus,
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        rdataset: &Rdataset,
        sig: Option<&Rdataset>,
        is_answer: bool,
    ) -> ValidationOutcome;
}

/// Default hook: accepts everything as insecure.
pub struct NullValidator;

#[async_trait]
impl Validator for NullValidator {
    async fn validate(
        &self,
        _rdataset: &Rdataset,
        _sig: Option<&Rdataset>,
        _is_answer: bool,
    ) -> ValidationOutcome {
        ValidationOutcome::Insecure
    }
}
