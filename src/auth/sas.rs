//! Shared-access-signature computation.
//!
//! A SAS password is an HMAC-SHA256 signature over the token audience and a
//! unix expiry, wrapped in the `SharedAccessSignature` string shape the
//! service authenticates against.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{ErrorKind, IotHubError, IotHubResult};

type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters stay literal; everything else is escaped
/// inside the `sr` and `sig` fields.
const SAS_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// An issued SAS password together with its refresh schedule.
#[derive(Clone, PartialEq)]
pub struct SasToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
    /// When the owner should issue a replacement. `None` means the token
    /// never needs refreshing (externally managed credentials).
    pub refresh_on: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The signature itself stays out of logs.
        f.debug_struct("SasToken")
            .field("expires_on", &self.expires_on)
            .field("refresh_on", &self.refresh_on)
            .finish_non_exhaustive()
    }
}

/// Issues SAS tokens for an audience. Implemented by the built-in
/// shared-key signer and by caller-supplied refreshers.
pub trait SasTokenSource: Send + Sync {
    fn issue(&self, audience: &str, now: DateTime<Utc>) -> IotHubResult<SasToken>;
}

/// Signs tokens with a base64 shared key.
#[derive(Clone)]
pub struct SharedAccessKeySigner {
    key: String,
    policy_name: Option<String>,
    time_to_live: ChronoDuration,
    /// Fraction of the TTL reserved as refresh headroom before expiry.
    refresh_buffer: f64,
}

impl SharedAccessKeySigner {
    pub fn new(key: impl Into<String>, policy_name: Option<String>) -> Self {
        Self {
            key: key.into(),
            policy_name,
            time_to_live: ChronoDuration::hours(1),
            refresh_buffer: 0.15,
        }
    }

    pub fn with_time_to_live(mut self, ttl: ChronoDuration) -> Self {
        self.time_to_live = ttl;
        self
    }

    fn sign(&self, string_to_sign: &str) -> IotHubResult<String> {
        let key = BASE64.decode(&self.key).map_err(|e| {
            IotHubError::with_source(
                ErrorKind::ArgumentInvalid,
                "Shared access key is not valid base64",
                e,
            )
        })?;
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| {
            IotHubError::with_source(ErrorKind::ArgumentInvalid, "Shared access key is empty", e)
        })?;
        mac.update(string_to_sign.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

impl SasTokenSource for SharedAccessKeySigner {
    fn issue(&self, audience: &str, now: DateTime<Utc>) -> IotHubResult<SasToken> {
        let expires_on = now + self.time_to_live;
        let expiry_seconds = expires_on.timestamp();
        let encoded_audience = utf8_percent_encode(audience, SAS_SET).to_string();

        let string_to_sign = format!("{encoded_audience}\n{expiry_seconds}");
        let signature = self.sign(&string_to_sign)?;
        let encoded_signature = utf8_percent_encode(&signature, SAS_SET).to_string();

        let mut token = format!(
            "SharedAccessSignature sr={encoded_audience}&sig={encoded_signature}&se={expiry_seconds}"
        );
        if let Some(policy) = &self.policy_name {
            token.push_str("&skn=");
            token.push_str(policy);
        }

        let buffer = ChronoDuration::seconds(
            (self.time_to_live.num_seconds() as f64 * self.refresh_buffer) as i64,
        );
        Ok(SasToken {
            token,
            expires_on,
            refresh_on: Some(expires_on - buffer),
        })
    }
}

/// Wraps a pre-computed SAS string the caller owns; never refreshed here.
pub struct StaticSasSource {
    token: String,
}

impl StaticSasSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl SasTokenSource for StaticSasSource {
    fn issue(&self, _audience: &str, _now: DateTime<Utc>) -> IotHubResult<SasToken> {
        Ok(SasToken {
            token: self.token.clone(),
            expires_on: DateTime::<Utc>::MAX_UTC,
            refresh_on: None,
        })
    }
}
