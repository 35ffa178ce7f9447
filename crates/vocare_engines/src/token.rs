#![forbid(unsafe_code)]

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use vocare_kernel_contracts::{ClaimsInput, PhoneKey, ReasonCodeId, SessionClaims, UnixTimeMs};

pub mod reason_codes {
    use vocare_kernel_contracts::ReasonCodeId;

    pub const TOKEN_EXPIRED: ReasonCodeId = ReasonCodeId(0x544B_00F1);
    pub const TOKEN_BAD_SIGNATURE: ReasonCodeId = ReasonCodeId(0x544B_00F2);
    pub const TOKEN_MALFORMED: ReasonCodeId = ReasonCodeId(0x544B_00F3);
    pub const TOKEN_MISSING_SUBJECT: ReasonCodeId = ReasonCodeId(0x544B_00F4);
}

pub const SIGNING_SECRET_MIN_BYTES: usize = 32;
pub const TOKEN_TTL_MIN_SECS: u64 = 60;
pub const TOKEN_TTL_MAX_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    pub ttl_secs: u64,
}

impl TokenConfig {
    pub fn mvp_v1() -> Self {
        Self { ttl_secs: 3_600 }
    }

    pub fn with_ttl_minutes(minutes: u64) -> Result<Self, TokenIssueError> {
        let ttl_secs = minutes.saturating_mul(60);
        if !(TOKEN_TTL_MIN_SECS..=TOKEN_TTL_MAX_SECS).contains(&ttl_secs) {
            return Err(TokenIssueError::InvalidTtl { ttl_secs });
        }
        Ok(Self { ttl_secs })
    }
}

/// HMAC key material. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, TokenIssueError> {
        let bytes = bytes.into();
        if bytes.len() < SIGNING_SECRET_MIN_BYTES {
            return Err(TokenIssueError::WeakSecret { got: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Random per-process secret; tokens die with the process.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SIGNING_SECRET_MIN_BYTES * 2];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningSecret(<{} bytes redacted>)", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenIssueError {
    #[error("signing secret must be at least {SIGNING_SECRET_MIN_BYTES} bytes, got {got}")]
    WeakSecret { got: usize },
    #[error("token ttl {ttl_secs}s outside {TOKEN_TTL_MIN_SECS}..={TOKEN_TTL_MAX_SECS}")]
    InvalidTtl { ttl_secs: u64 },
    #[error("token encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum TokenInvalid {
    #[error("token expired")]
    Expired,
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token is malformed")]
    Malformed,
    #[error("token has no subject")]
    MissingSubject,
}

impl TokenInvalid {
    pub fn code(self) -> &'static str {
        match self {
            Self::Expired => "TOKEN_EXPIRED",
            Self::BadSignature => "TOKEN_BAD_SIGNATURE",
            Self::Malformed => "TOKEN_MALFORMED",
            Self::MissingSubject => "TOKEN_MISSING_SUBJECT",
        }
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            Self::Expired => reason_codes::TOKEN_EXPIRED,
            Self::BadSignature => reason_codes::TOKEN_BAD_SIGNATURE,
            Self::Malformed => reason_codes::TOKEN_MALFORMED,
            Self::MissingSubject => reason_codes::TOKEN_MISSING_SUBJECT,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WireClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    iat: u64,
    exp: u64,
}

/// Issues and verifies HS256 session tokens bound to a phone key.
///
/// The clock is always passed in; expiry is checked against that value with
/// no leeway.
#[derive(Clone)]
pub struct TokenService {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(config: TokenConfig, secret: &SigningSecret) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        Self {
            config,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn config(&self) -> TokenConfig {
        self.config
    }

    pub fn issue(
        &self,
        input: &ClaimsInput,
        now: UnixTimeMs,
    ) -> Result<SignedToken, TokenIssueError> {
        let iat = now.as_secs();
        let exp = iat.saturating_add(self.config.ttl_secs);
        let claims = WireClaims {
            sub: Some(input.subject.as_str().to_string()),
            name: input.name.clone(),
            email: input.email.clone(),
            iat,
            exp,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenIssueError::Encode(e.to_string()))?;
        Ok(SignedToken {
            token,
            expires_at: UnixTimeMs::from_secs(exp),
        })
    }

    pub fn verify(&self, token: &str, now: UnixTimeMs) -> Result<SessionClaims, TokenInvalid> {
        let data = jsonwebtoken::decode::<WireClaims>(token.trim(), &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenInvalid::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenInvalid::BadSignature
                }
                _ => TokenInvalid::Malformed,
            })?;
        let wire = data.claims;

        let expires_at = UnixTimeMs::from_secs(wire.exp);
        if now >= expires_at {
            return Err(TokenInvalid::Expired);
        }

        let subject = match wire.sub.as_deref().map(str::trim) {
            None | Some("") => return Err(TokenInvalid::MissingSubject),
            Some(sub) => PhoneKey::new(sub).map_err(|_| TokenInvalid::Malformed)?,
        };

        Ok(SessionClaims {
            subject,
            name: wire.name,
            email: wire.email,
            issued_at: UnixTimeMs::from_secs(wire.iat),
            expires_at,
        })
    }
}
