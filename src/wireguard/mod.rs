//! WireGuard identity management
//!
//! Key generation and validation for overlay peers. The system never moves
//! overlay traffic itself; it only hands out identities and configuration
//! for remote WireGuard implementations to apply.

mod keys;

pub use keys::{generate_preshared_key, is_valid_key, KeyPair, PrivateKey, PublicKey};
