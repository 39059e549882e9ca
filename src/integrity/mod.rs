pub mod error;
pub mod types;
pub mod verifier;

pub use error::IntegrityError;
pub use types::{ChecksumType, ContentHasher, VerificationResult};
pub use verifier::IntegrityVerifier;
