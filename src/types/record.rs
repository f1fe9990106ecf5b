use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::fmt::{Display, Formatter};

/// A private key and certificate bound to a single origin.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BoundCertRecord {
    pub server_identifier: String,
    pub creation_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    #[serde_as(as = "Base64")]
    pub private_key: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub certificate: Vec<u8>,
}

impl BoundCertRecord {
    pub fn new(
        server_identifier: impl Into<String>,
        creation_time: DateTime<Utc>,
        expiration_time: DateTime<Utc>,
        private_key: impl Into<Vec<u8>>,
        certificate: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            server_identifier: server_identifier.into(),
            creation_time,
            expiration_time,
            private_key: private_key.into(),
            certificate: certificate.into(),
        }
    }

    /// Whether `creation_time` lies in `[begin, end)`. A missing bound is open.
    pub fn created_between(
        &self,
        begin: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> bool {
        begin.map_or(true, |begin| self.creation_time >= begin)
            && end.map_or(true, |end| self.creation_time < end)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time <= now
    }
}

impl Display for BoundCertRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{} ~ {}]",
            self.server_identifier,
            self.creation_time.to_rfc3339(),
            self.expiration_time.to_rfc3339()
        )
    }
}
