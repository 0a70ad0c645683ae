//! # Tusk Crypto
//!
//! Integrity and signing primitives for the Tusk upload engine.
//!
//! This crate provides:
//! - **Checksum pipeline**: SHA-1, MD5 and Adler-32 computed in one pass over a byte stream
//! - **Verification**: priority-ordered comparison against a caller-declared digest
//! - **Transfer tokens**: short-lived HS256 tokens that scope access to a single upload
//!
//! ## Example
//!
//! ```rust,ignore
//! use tusk_crypto::{checksum_file, ExpectedChecksum, TokenIssuer};
//!
//! let sums = checksum_file(&bin_path).await?;
//! if let Some(expected) = ExpectedChecksum::select(&sha1, &md5, &adler32) {
//!     sums.verify(&expected)?;
//! }
//!
//! let issuer = TokenIssuer::new("shared-secret", chrono::Duration::hours(1));
//! let token = issuer.issue("https://gateway/data/tus/1234")?;
//! ```

pub mod checksum;
pub mod error;
pub mod token;

pub use checksum::{
    checksum_file, checksum_reader, ChecksumAlgorithm, ChecksumPipeline, ChecksumSet,
    ExpectedChecksum,
};
pub use error::{CryptoError, Result};
pub use token::{TokenIssuer, TransferClaims, TOKEN_AUDIENCE, TOKEN_ISSUER};

/// Read buffer size used when streaming files through the checksum pipeline (32 KB)
pub const CHECKSUM_BUFFER_SIZE: usize = 32 * 1024;
