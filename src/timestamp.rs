//! Wall-clock timestamps stored as `timestamptz`.
//!
//! SQLx does not ship `jiff` support yet, so [`Timestamp`] bridges the two.
//! Postgres sends `timestamptz` as microseconds since 2000-01-01 in binary
//! form and as RFC 3339 text otherwise; both are handled.

use std::{fmt, str::FromStr};

use jiff::{SignedDuration, Span};
use serde::{Deserialize, Serialize};
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    postgres::{types::Oid, PgArgumentBuffer, PgHasArrayType, PgTypeInfo, PgValueFormat},
    Database, Decode, Encode, Postgres, Type,
};

// 1184 is `timestamptz` and 1185 its array type.
const TIMESTAMPTZ_OID: u32 = 1184;
const TIMESTAMPTZ_ARRAY_OID: u32 = 1185;

// Seconds between the Unix epoch and the Postgres epoch of 2000-01-01.
const POSTGRES_EPOCH_UNIX_SECONDS: i64 = 946_684_800;

/// A point in time, as recorded on queued tasks and their results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub jiff::Timestamp);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(jiff::Timestamp::now())
    }

    /// Adds `span`, returning an error when the result is out of range.
    pub fn checked_add(&self, span: Span) -> Result<Self, jiff::Error> {
        self.0.checked_add(span).map(Self)
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn millis_since(&self, earlier: Timestamp) -> i64 {
        self.0.duration_since(earlier.0).as_millis().max(0) as i64
    }
}

impl From<jiff::Timestamp> for Timestamp {
    fn from(ts: jiff::Timestamp) -> Self {
        Self(ts)
    }
}

impl From<Timestamp> for jiff::Timestamp {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn postgres_epoch() -> jiff::Timestamp {
    jiff::Timestamp::UNIX_EPOCH + SignedDuration::from_secs(POSTGRES_EPOCH_UNIX_SECONDS)
}

impl Type<Postgres> for Timestamp {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(TIMESTAMPTZ_OID))
    }
}

impl PgHasArrayType for Timestamp {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(TIMESTAMPTZ_ARRAY_OID))
    }
}

impl Encode<'_, Postgres> for Timestamp {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        let micros = self.0.duration_since(postgres_epoch()).as_micros();
        let micros = i64::try_from(micros)
            .map_err(|_| format!("timestamp {} does not fit a timestamptz", self.0))?;
        Encode::<Postgres>::encode(micros, buf)
    }

    fn size_hint(&self) -> usize {
        size_of::<i64>()
    }
}

impl<'r> Decode<'r, Postgres> for Timestamp {
    fn decode(value: <Postgres as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let ts = match value.format() {
            PgValueFormat::Binary => {
                let micros: i64 = Decode::<Postgres>::decode(value)?;
                postgres_epoch().checked_add(SignedDuration::from_micros(micros))?
            }
            PgValueFormat::Text => jiff::Timestamp::from_str(value.as_str()?)?,
        };
        Ok(Self(ts))
    }
}
