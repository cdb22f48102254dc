//! Curve25519 keypair generation and key-material transcoding.
//!
//! The control plane persists keys as base64 (matching the original schema
//! and every `wg`-compatible config file); the IPC dialect in [`super::ipc`]
//! speaks hex on the wire, per `boringtun`'s UAPI convention.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use rand::RngCore;

use crate::error::{AppError, Result};

/// Generate a new Curve25519 keypair, returning `(private_key_b64, public_key_b64)`.
///
/// Clamping follows RFC 7748 §5: clear the low 3 bits and the high bit of the
/// scalar, then set bit 254. `x25519_dalek::x25519` performs this internally
/// when deriving the public point, so the private scalar stored here is the
/// clamped value actually used for key agreement.
pub fn generate_keypair() -> (String, String) {
    let mut scalar = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut scalar);
    clamp_scalar(&mut scalar);

    let public = x25519_dalek::x25519(scalar, x25519_dalek::X25519_BASEPOINT_BYTES);
    (B64.encode(scalar), B64.encode(public))
}

/// Derive the preshared-key field the way `wg genpsk` does: a raw random
/// 32-byte value, base64-encoded. Unlike the private key it is not clamped.
pub fn generate_preshared_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64.encode(bytes)
}

fn clamp_scalar(scalar: &mut [u8; 32]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

/// Derive the base64 public key for a base64-encoded private key.
pub fn public_from_private_b64(private_key_b64: &str) -> Result<String> {
    let bytes = B64
        .decode(private_key_b64)
        .map_err(|e| AppError::KeyMaterialInvalid(e.to_string()))?;
    let scalar: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AppError::KeyMaterialInvalid("private key must be 32 bytes".into()))?;
    let public = x25519_dalek::x25519(scalar, x25519_dalek::X25519_BASEPOINT_BYTES);
    Ok(B64.encode(public))
}

/// Re-encode a base64 key (as stored) into the lowercase-hex form the IPC
/// dialect uses on the wire.
pub fn b64_to_hex(key_b64: &str) -> Result<String> {
    let bytes = B64
        .decode(key_b64)
        .map_err(|e| AppError::KeyMaterialInvalid(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Re-encode a lowercase-hex wire key into the base64 form used for storage.
pub fn hex_to_b64(key_hex: &str) -> Result<String> {
    let bytes = hex::decode(key_hex).map_err(|e| AppError::KeyMaterialInvalid(e.to_string()))?;
    Ok(B64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_keypair_round_trips_through_hex() {
        let (private, public) = generate_keypair();
        let derived = public_from_private_b64(&private).unwrap();
        assert_eq!(derived, public);

        let hex = b64_to_hex(&public).unwrap();
        let back = hex_to_b64(&hex).unwrap();
        assert_eq!(back, public);
    }

    #[test]
    fn clamp_scalar_sets_expected_bits() {
        let mut scalar = [0xffu8; 32];
        clamp_scalar(&mut scalar);
        assert_eq!(scalar[0] & 0x07, 0);
        assert_eq!(scalar[31] & 0x80, 0);
        assert_eq!(scalar[31] & 0x40, 0x40);
    }

    #[test]
    fn generate_preshared_key_is_32_bytes() {
        let psk = generate_preshared_key();
        assert_eq!(B64.decode(psk).unwrap().len(), 32);
    }
}
