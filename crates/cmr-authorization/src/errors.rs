//! Credential errors and their mapping onto the shared taxonomy.

use cmr_core::CmrError;

/// Failures while minting or checking a credential
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Signature, encoding or expiry check failed
    #[error("credential verification failed: {0}")]
    Verification(String),

    /// A declared caveat does not match the request
    #[error("{caveat} mismatch: credential declares {declared:?}, request needs {required:?}")]
    CaveatMismatch {
        caveat: &'static str,
        declared: String,
        required: String,
    },

    /// A caveat needed for the request is absent
    #[error("credential does not declare {0}")]
    MissingCaveat(&'static str),

    #[error("no credentials supplied")]
    NoCredentials,

    /// Token construction failed
    #[error("minting credential: {0}")]
    Mint(String),
}

impl From<CredentialError> for CmrError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Mint(_) => CmrError::internal(err.to_string()),
            _ => CmrError::permission_denied(err.to_string()),
        }
    }
}
