use super::CallerIdentity;
use crate::config::JwtConfig;
use crate::error::{AuthError, ConfigError};
use crate::secrets::{resolve_key_material, resolve_public};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// JWT claims structure.
///
/// `userId` and `role` follow the layout of tokens minted by the
/// authentication service; `sub`, `roles` and `scope` are the standard
/// spellings.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<serde_json::Value>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Expiration time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Not before (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Space separated scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Additional custom claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == expected,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

/// Everything needed to check a signature. Replaced as a whole on rotation.
struct KeyRing {
    algorithm: Algorithm,
    primary: DecodingKey,
    by_kid: HashMap<String, DecodingKey>,
    validation: Validation,
    issuer: Option<String>,
    audience: Option<String>,
    clock_skew_secs: u64,
}

impl KeyRing {
    fn from_config(config: &JwtConfig) -> Result<Self, ConfigError> {
        let algorithm = parse_algorithm(&config.algorithm)?;
        let primary = decoding_key(
            algorithm,
            config.secret.as_ref(),
            config.public_key.as_deref(),
            "primary",
        )?;

        let mut by_kid = HashMap::with_capacity(config.keys.len());
        for key in &config.keys {
            let decoding =
                decoding_key(algorithm, key.secret.as_ref(), key.public_key.as_deref(), &key.kid)?;
            by_kid.insert(key.kid.clone(), decoding);
        }

        // Signature and algorithm only. Time, issuer and audience checks
        // run against the caller-supplied clock in `TokenVerifier::verify`.
        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Ok(Self {
            algorithm,
            primary,
            by_kid,
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock_skew_secs: config.clock_skew_secs,
        })
    }

    /// Key for a token header: the matching `kid` if there is one, the
    /// primary key otherwise
    fn key_for(&self, kid: Option<&str>) -> &DecodingKey {
        kid.and_then(|kid| self.by_kid.get(kid))
            .unwrap_or(&self.primary)
    }
}

/// Validates bearer tokens and turns them into a [`CallerIdentity`].
///
/// Verification takes a snapshot of the key ring and never holds a lock
/// while decoding, so rotation does not stall in-flight requests.
pub struct TokenVerifier {
    ring: RwLock<Arc<KeyRing>>,
}

impl TokenVerifier {
    /// Create a new verifier from configuration
    pub fn new(config: &JwtConfig) -> Result<Self, ConfigError> {
        let ring = KeyRing::from_config(config)?;
        info!(
            algorithm = ?ring.algorithm,
            extra_keys = ring.by_kid.len(),
            issuer = ?ring.issuer,
            "Token verifier initialized"
        );
        Ok(Self {
            ring: RwLock::new(Arc::new(ring)),
        })
    }

    /// Replace the key material. On error the current keys stay in use.
    pub fn rotate(&self, config: &JwtConfig) -> Result<(), ConfigError> {
        let ring = Arc::new(KeyRing::from_config(config)?);
        let mut guard = self.ring.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = ring;
        info!("Token verifier key material rotated");
        Ok(())
    }

    fn snapshot(&self) -> Arc<KeyRing> {
        let guard = self.ring.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Verify `token` as of `now`
    pub fn verify(&self, token: &str, now: SystemTime) -> Result<CallerIdentity, AuthError> {
        let ring = self.snapshot();

        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "Malformed token header");
            AuthError::InvalidToken
        })?;
        if header.alg != ring.algorithm {
            debug!(alg = ?header.alg, expected = ?ring.algorithm, "Token algorithm rejected");
            return Err(AuthError::InvalidToken);
        }

        let key = ring.key_for(header.kid.as_deref());
        let claims = decode::<Claims>(token, key, &ring.validation)
            .map_err(|e| {
                debug!(error = %e, "Token validation failed");
                map_jwt_error(e.kind())
            })?
            .claims;

        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let skew = ring.clock_skew_secs;

        let exp = claims.exp.ok_or(AuthError::InvalidToken)?;
        if now_secs >= exp.saturating_add(skew) {
            return Err(AuthError::TokenExpired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now_secs.saturating_add(skew) {
                debug!(nbf, now = now_secs, "Token used before nbf");
                return Err(AuthError::InvalidToken);
            }
        }

        if let Some(expected) = &ring.issuer {
            if claims.iss.as_deref() != Some(expected.as_str()) {
                return Err(AuthError::InvalidIssuer);
            }
        }
        if let Some(expected) = &ring.audience {
            if !claims.aud.as_ref().is_some_and(|aud| aud.contains(expected)) {
                return Err(AuthError::InvalidIssuer);
            }
        }

        into_identity(claims)
    }
}

fn into_identity(claims: Claims) -> Result<CallerIdentity, AuthError> {
    let subject = claims
        .sub
        .filter(|sub| !sub.is_empty())
        .or_else(|| claims.user_id.as_ref().and_then(claim_to_string))
        .ok_or(AuthError::InvalidToken)?;

    let mut roles = BTreeSet::new();
    if let Some(role) = claims.role {
        roles.insert(role);
    }
    roles.extend(claims.roles.unwrap_or_default());
    if let Some(scope) = &claims.scope {
        roles.extend(scope.split_whitespace().map(str::to_string));
    }

    Ok(CallerIdentity {
        subject: Some(subject),
        issuer: claims.iss,
        issued_at: claims.iat,
        expires_at: claims.exp,
        roles,
        claims: claims.extra,
    })
}

fn claim_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn map_jwt_error(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => AuthError::InvalidIssuer,
        _ => AuthError::InvalidToken,
    }
}

fn decoding_key(
    algorithm: Algorithm,
    secret: Option<&SecretString>,
    public_key: Option<&str>,
    label: &str,
) -> Result<DecodingKey, ConfigError> {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = secret.ok_or_else(|| {
                ConfigError::MissingKeyMaterial(format!(
                    "JWT secret is required for {:?} ({} key)",
                    algorithm, label
                ))
            })?;
            let secret = resolve_key_material(secret)?;
            if secret.expose_secret().is_empty() {
                return Err(ConfigError::InvalidKeyMaterial(format!(
                    "JWT secret cannot be empty ({} key)",
                    label
                )));
            }
            Ok(DecodingKey::from_secret(secret.expose_secret().as_bytes()))
        }
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            let pem = public_pem(algorithm, public_key, label)?;
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                ConfigError::InvalidKeyMaterial(format!("Invalid RSA public key ({}): {}", label, e))
            })
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            let pem = public_pem(algorithm, public_key, label)?;
            DecodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
                ConfigError::InvalidKeyMaterial(format!("Invalid EC public key ({}): {}", label, e))
            })
        }
        other => Err(ConfigError::Invalid(format!(
            "Unsupported JWT algorithm: {:?}",
            other
        ))),
    }
}

fn public_pem(
    algorithm: Algorithm,
    public_key: Option<&str>,
    label: &str,
) -> Result<String, ConfigError> {
    let reference = public_key.ok_or_else(|| {
        ConfigError::MissingKeyMaterial(format!(
            "JWT public key is required for {:?} ({} key)",
            algorithm, label
        ))
    })?;
    resolve_public(reference)
}

/// Parse algorithm string to Algorithm enum
fn parse_algorithm(algo: &str) -> Result<Algorithm, ConfigError> {
    match algo.to_uppercase().as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        _ => Err(ConfigError::Invalid(format!(
            "Unsupported JWT algorithm: {}",
            algo
        ))),
    }
}
