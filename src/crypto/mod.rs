//! Signing keys and signatures

pub mod custody;
pub mod key_management;
pub mod signatures;

pub use custody::CustodyClient;
pub use key_management::{KeyManager, KeyMetadata, KeyStatus, LocalKeyStore, SigningKey};
pub use signatures::{SignatureManager, SIGNATURE_ALGORITHM};
