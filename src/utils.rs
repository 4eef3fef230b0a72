use crate::config::IceServerConfig;
use crate::error::ConfigError;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};

type HmacSha1 = Hmac<Sha1>;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    // Если url уже начинается с "turn:", "turns:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Короткий отпечаток SDP: 48 бит SHA-256 (12 hex-символов).
/// Обе стороны сверяют его голосом, чтобы убедиться, что текст вставлен целиком.
pub fn sdp_fingerprint(sdp: &str) -> String {
    let digest = Sha256::digest(sdp.as_bytes());
    hex::encode(&digest[..6])
}

/// Временные учётные данные TURN по схеме REST API coturn (`use-auth-secret`):
/// username = `"{expiry}:{user}"`, credential = base64(HMAC-SHA1(secret, username)).
pub fn turn_rest_credentials(
    secret: &str,
    user: &str,
    expiry: i64,
) -> Result<(String, String), ConfigError> {
    let username = format!("{expiry}:{user}");
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| ConfigError::TurnCredentials(e.to_string()))?;
    mac.update(username.as_bytes());
    let credential = general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok((username, credential))
}
