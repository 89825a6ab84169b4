//! Identifier generation.
//!
//! Every generated unit gets an [`Identifier`] from an [`IdentifierGenerator`].
//! The default [`MonoUlidGenerator`] wraps `ferroid`'s lock-based monotonic
//! ULID generator: a 48-bit millisecond timestamp followed by 80 random bits,
//! rendered as 26 Crockford base32 characters. IDs issued in the same
//! millisecond increment the random component, so two calls in one process
//! never collide, even from concurrent requests.
//!
//! [`NumericGenerator`] issues fixed-width decimal tokens for symbologies that
//! only encode digits (EAN-13).
//!
//! The timestamp schemes ([`SeedMillisGenerator`], [`DigestMillisGenerator`])
//! derive the token from `(seed, current millis)` alone. They collide when two
//! requests for the same seed land in the same millisecond and are kept only
//! for compatibility with identifiers already issued under them.

use crate::{error::IdentifierError, types::Identifier};
use core::{fmt, str::FromStr, time::Duration};
use ferroid::{
    base32::Base32UlidExt,
    generator::{IdGenStatus, LockMonoUlidGenerator},
    id::ULID,
    rand::ThreadRandom,
    time::{MonotonicClock, TimeSource},
};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Origin of ULID and legacy timestamps.
const UNIX_EPOCH: Duration = Duration::ZERO;
const DIGEST_HEX_CHARS: usize = 16;

/// Width of [`NumericGenerator`] tokens, the EAN-13 body length.
pub const NUMERIC_ID_DIGITS: usize = 12;
const NUMERIC_ID_LIMIT: u64 = 1_000_000_000_000;

/// Produces one identifier per generated unit.
pub trait IdentifierGenerator: Send + Sync {
    /// Returns a fresh identifier. `seed` is the request's name or value and
    /// must be non-empty; schemes that don't embed it ignore it.
    ///
    /// # Errors
    ///
    /// [`IdentifierError`] if the scheme cannot issue another token.
    fn new_identifier(&self, seed: &str) -> Result<Identifier, IdentifierError>;
}

/// Thread-safe monotonic ULIDs.
///
/// Same-millisecond calls increment the previous random component. If the
/// random space of one millisecond runs out, the generator waits for the
/// clock to move on.
pub struct MonoUlidGenerator<T = MonotonicClock>
where
    T: TimeSource<u128>,
{
    inner: LockMonoUlidGenerator<ULID, T, ThreadRandom>,
}

impl MonoUlidGenerator {
    /// ULIDs on a monotonic clock aligned to the Unix epoch.
    pub fn system() -> Self {
        Self::new(MonotonicClock::with_epoch(UNIX_EPOCH))
    }
}

impl<T: TimeSource<u128>> MonoUlidGenerator<T> {
    pub fn new(time: T) -> Self {
        Self {
            inner: LockMonoUlidGenerator::new(time, ThreadRandom),
        }
    }

    /// Returns the next ULID, yielding while the generator is pending.
    pub fn next_ulid(&self) -> Result<ULID, IdentifierError> {
        loop {
            match self.inner.try_next_id()? {
                IdGenStatus::Ready { id } => break Ok(id),
                IdGenStatus::Pending { .. } => std::thread::yield_now(),
            }
        }
    }
}

impl<T> IdentifierGenerator for MonoUlidGenerator<T>
where
    T: TimeSource<u128> + Send + Sync,
{
    fn new_identifier(&self, _seed: &str) -> Result<Identifier, IdentifierError> {
        let id = self.next_ulid()?;
        Ok(Identifier::new(id.encode().to_string()))
    }
}

/// Strictly increasing 12-digit decimal identifiers.
///
/// Each token is the current millisecond since the clock's epoch, or the
/// previous token plus one when the clock hasn't moved past it. With the
/// default `ferroid` epoch (2025-01-01) the width holds until the 2050s.
pub struct NumericGenerator<T = MonotonicClock> {
    last: Mutex<Option<u64>>,
    time: T,
}

impl NumericGenerator {
    pub fn system() -> Self {
        Self::new(MonotonicClock::default())
    }
}

impl<T: TimeSource<u64>> NumericGenerator<T> {
    pub fn new(time: T) -> Self {
        Self {
            last: Mutex::new(None),
            time,
        }
    }

    fn next_value(&self) -> Result<u64, IdentifierError> {
        let now = self.time.current_millis();
        let mut last = self.last.lock();
        let next = match *last {
            Some(previous) if previous >= now => previous + 1,
            _ => now,
        };
        if next >= NUMERIC_ID_LIMIT {
            return Err(IdentifierError::NumericOverflow(next));
        }
        *last = Some(next);
        Ok(next)
    }
}

impl<T> IdentifierGenerator for NumericGenerator<T>
where
    T: TimeSource<u64> + Send + Sync,
{
    fn new_identifier(&self, _seed: &str) -> Result<Identifier, IdentifierError> {
        let value = self.next_value()?;
        Ok(Identifier::new(format!(
            "{value:0>width$}",
            width = NUMERIC_ID_DIGITS
        )))
    }
}

/// Legacy scheme: sanitized seed followed by the millisecond timestamp.
pub struct SeedMillisGenerator<T = MonotonicClock> {
    time: T,
}

impl SeedMillisGenerator {
    pub fn system() -> Self {
        Self::new(MonotonicClock::with_epoch(UNIX_EPOCH))
    }
}

impl<T: TimeSource<u64>> SeedMillisGenerator<T> {
    pub const fn new(time: T) -> Self {
        Self { time }
    }
}

impl<T> IdentifierGenerator for SeedMillisGenerator<T>
where
    T: TimeSource<u64> + Send + Sync,
{
    fn new_identifier(&self, seed: &str) -> Result<Identifier, IdentifierError> {
        Ok(Identifier::new(format!(
            "{}{}",
            sanitize_seed(seed),
            self.time.current_millis()
        )))
    }
}

/// Legacy scheme: truncated SHA-256 of the seed followed by the millisecond
/// timestamp.
pub struct DigestMillisGenerator<T = MonotonicClock> {
    time: T,
}

impl DigestMillisGenerator {
    pub fn system() -> Self {
        Self::new(MonotonicClock::with_epoch(UNIX_EPOCH))
    }
}

impl<T: TimeSource<u64>> DigestMillisGenerator<T> {
    pub const fn new(time: T) -> Self {
        Self { time }
    }
}

impl<T> IdentifierGenerator for DigestMillisGenerator<T>
where
    T: TimeSource<u64> + Send + Sync,
{
    fn new_identifier(&self, seed: &str) -> Result<Identifier, IdentifierError> {
        let digest = Sha256::digest(seed.as_bytes());
        let hex: String = digest
            .iter()
            .take(DIGEST_HEX_CHARS / 2)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        Ok(Identifier::new(format!(
            "{hex}{}",
            self.time.current_millis()
        )))
    }
}

/// Keeps characters that are safe in file names and storage keys.
fn sanitize_seed(seed: &str) -> String {
    let cleaned: String = seed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// Selectable identifier scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdScheme {
    #[default]
    Ulid,
    /// 12 decimal digits; the only scheme EAN-13 can encode.
    Numeric,
    SeedMillis,
    DigestMillis,
}

impl IdScheme {
    /// Builds the process-wide generator for this scheme.
    pub fn build(self) -> Arc<dyn IdentifierGenerator> {
        match self {
            Self::Ulid => Arc::new(MonoUlidGenerator::system()),
            Self::Numeric => Arc::new(NumericGenerator::system()),
            Self::SeedMillis => Arc::new(SeedMillisGenerator::system()),
            Self::DigestMillis => Arc::new(DigestMillisGenerator::system()),
        }
    }

    /// Whether every token is made of decimal digits only.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Numeric)
    }
}

impl fmt::Display for IdScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ulid => "ulid",
            Self::Numeric => "numeric",
            Self::SeedMillis => "seed-millis",
            Self::DigestMillis => "digest-millis",
        })
    }
}

impl FromStr for IdScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ulid" => Ok(Self::Ulid),
            "numeric" => Ok(Self::Numeric),
            "seed-millis" => Ok(Self::SeedMillis),
            "digest-millis" => Ok(Self::DigestMillis),
            other => Err(format!(
                "unknown id scheme `{other}` (expected ulid, numeric, seed-millis or digest-millis)"
            )),
        }
    }
}
