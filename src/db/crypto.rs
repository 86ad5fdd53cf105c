use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{Context, Result};
use base64::Engine as _;
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::info;

use super::Database;

/// Derive a 256-bit AES key using HKDF-SHA256.
///
/// Salt and info strings are fixed per-application, so the same `key_str`
/// always produces the same derived key. HKDF extracts a uniform key from a
/// potentially non-uniform input; it adds no stretching, so the configured
/// key should be high-entropy.
fn derive_key(key_str: &str) -> Key<Aes256Gcm> {
    let hkdf = Hkdf::<Sha256>::new(Some(b"aiwebengine-secret-vault"), key_str.as_bytes());
    let mut okm = [0u8; 32];
    hkdf.expand(b"aes-256-gcm-key", &mut okm)
        .expect("HKDF-SHA256 expand to 32 bytes cannot fail");
    #[allow(deprecated)]
    *Key::<Aes256Gcm>::from_slice(&okm)
}

/// Encrypt plaintext with AES-256-GCM. Returns base64(nonce || ciphertext).
pub fn encrypt(plaintext: &str, key_str: &str) -> Result<String> {
    let key = derive_key(key_str);
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
}

/// Decrypt base64(nonce || ciphertext) with AES-256-GCM.
pub fn decrypt(encrypted: &str, key_str: &str) -> Result<String> {
    decrypt_with_key(&derive_key(key_str), encrypted)
}

fn decrypt_with_key(key: &Key<Aes256Gcm>, encrypted: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(key);
    let combined = base64::engine::general_purpose::STANDARD
        .decode(encrypted)
        .context("invalid base64")?;

    if combined.len() < 12 {
        anyhow::bail!("ciphertext too short");
    }

    let (nonce_bytes, ciphertext) = combined.split_at(12);
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed — wrong key or corrupted data"))?;

    String::from_utf8(plaintext).context("decrypted value is not valid UTF-8")
}

/// Migrate secret values on startup.
///
/// For each `value_enc` in the secrets table (tried in order):
/// 1. Already encrypted with the current key → no action.
/// 2. Encrypted with the old key (rotation via `SECRETS_ENCRYPTION_KEY_OLD`) → re-encrypt.
/// 3. Plaintext → encrypt.
pub async fn migrate_plaintext_secrets(
    db: &Database,
    key: &str,
    old_key: Option<&str>,
) -> Result<()> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT identifier, value_enc FROM secrets")
        .fetch_all(&db.pool)
        .await
        .context("Failed to query secrets for encryption migration")?;

    let current_key = derive_key(key);

    let mut migrated_old_key = 0u32;
    let mut migrated_plaintext = 0u32;

    for (identifier, value_enc) in &rows {
        if decrypt_with_key(&current_key, value_enc).is_ok() {
            continue;
        }

        if let Some(old) = old_key {
            if let Ok(plaintext) = decrypt(value_enc, old) {
                update_secret_value(db, identifier, &encrypt(&plaintext, key)?).await?;
                migrated_old_key += 1;
                continue;
            }
        }

        update_secret_value(db, identifier, &encrypt(value_enc, key)?).await?;
        migrated_plaintext += 1;
    }

    if migrated_old_key > 0 {
        info!(
            count = migrated_old_key,
            "Re-encrypted secrets from old key to new key"
        );
    }
    if migrated_plaintext > 0 {
        info!(count = migrated_plaintext, "Encrypted plaintext secrets");
    }

    Ok(())
}

async fn update_secret_value(db: &Database, identifier: &str, value_enc: &str) -> Result<()> {
    sqlx::query("UPDATE secrets SET value_enc = ? WHERE identifier = ?")
        .bind(value_enc)
        .bind(identifier)
        .execute(&db.pool)
        .await
        .context("Failed to update encrypted secret value")?;
    Ok(())
}
