use crate::error::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::fs;
use tracing::debug;

/// Resolve a key material reference.
///
/// Supports formats:
/// - `env://VAR` - read from an environment variable
/// - `file:///path/to/key` - read from a file (surrounding whitespace trimmed)
/// - any other value is used as-is
pub fn resolve_key_material(value: &SecretString) -> Result<SecretString, ConfigError> {
    let raw = value.expose_secret();

    if let Some(var) = raw.strip_prefix("env://") {
        debug!(var, "Resolving key material from environment");
        env::var(var).map(SecretString::new).map_err(|_| {
            ConfigError::MissingKeyMaterial(format!("environment variable '{}' not set", var))
        })
    } else if let Some(path) = raw.strip_prefix("file://") {
        debug!(path, "Resolving key material from file");
        fs::read_to_string(path)
            .map(|s| SecretString::new(s.trim().to_string()))
            .map_err(|e| {
                ConfigError::MissingKeyMaterial(format!("failed to read {}: {}", path, e))
            })
    } else {
        Ok(value.clone())
    }
}

/// Same as [`resolve_key_material`] for values that are not secret, such as PEM public keys
pub fn resolve_public(value: &str) -> Result<String, ConfigError> {
    resolve_key_material(&SecretString::new(value.to_string()))
        .map(|resolved| resolved.expose_secret().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn test_plain_value_passes_through() {
        let resolved = resolve_key_material(&secret("plain-secret")).unwrap();
        assert_eq!(resolved.expose_secret(), "plain-secret");
    }

    #[test]
    fn test_env_reference() {
        std::env::set_var("AUTHGATE_TEST_JWT_SECRET", "from-env");
        let resolved = resolve_key_material(&secret("env://AUTHGATE_TEST_JWT_SECRET")).unwrap();
        assert_eq!(resolved.expose_secret(), "from-env");

        assert!(matches!(
            resolve_key_material(&secret("env://AUTHGATE_TEST_UNSET_VARIABLE")),
            Err(ConfigError::MissingKeyMaterial(_))
        ));
    }

    #[test]
    fn test_file_reference() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  file-secret  ").unwrap();

        let reference = format!("file://{}", file.path().display());
        let resolved = resolve_key_material(&secret(&reference)).unwrap();
        assert_eq!(resolved.expose_secret(), "file-secret");

        assert!(resolve_public("file:///nonexistent/key.pem").is_err());
    }
}
