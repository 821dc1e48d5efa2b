// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub credential_key: [u8; 32],
    pub fleet_config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("CREDENTIAL_KEY must be exactly 64 hex characters (32 bytes)")]
    InvalidCredentialKey,
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn parse_hex_32(hex: &str) -> Result<[u8; 32], ConfigError> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(ConfigError::InvalidCredentialKey);
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::InvalidCredentialKey)?;
    }
    Ok(out)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let credential_key = parse_hex_32(&require_env("CREDENTIAL_KEY")?)?;

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            jwt_secret: require_env("JWT_SECRET")?,
            credential_key,
            fleet_config: env::var("FLEET_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc/fleetward/fleet.toml")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn hex_key_decodes() {
        let key = parse_hex_32(&"0a".repeat(32)).unwrap();
        assert_eq!(key, [0x0a; 32]);
    }

    #[test]
    fn hex_key_tolerates_whitespace() {
        let padded = format!("  {}\n", "ff".repeat(32));
        assert_eq!(parse_hex_32(&padded).unwrap(), [0xff; 32]);
    }

    #[test_case("" ; "empty")]
    #[test_case("abcd" ; "short")]
    #[test_case(&"zz".repeat(32) ; "not hex")]
    #[test_case(&"0".repeat(65) ; "too long")]
    fn hex_key_rejected(input: &str) {
        assert!(matches!(
            parse_hex_32(input),
            Err(ConfigError::InvalidCredentialKey)
        ));
    }
}
