use std::fmt::Display;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::lock::Mutex;
use serde::{
    de::{
        Unexpected,
        Visitor,
    },
    Deserialize,
    Serialize,
};
use thiserror::Error;

/// An identifier used throughout WAMP messaging.
///
/// Always within `[1, 2^53]`, so the value survives a round trip through an
/// IEEE 754 double. "Unset" is expressed as the absence of an [`Id`], never
/// as a sentinel value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);

impl Id {
    pub const MIN: u64 = 1;
    pub const MAX: u64 = 1 << 53;
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("{value} is out of range for IDs")]
pub struct IdOutOfRange {
    value: u64,
}

impl IdOutOfRange {
    fn new(value: u64) -> Self {
        Self { value }
    }
}

/// Error for an allocator that has run out of identifiers in its scope.
#[derive(Debug, Error)]
#[error("identifier scope exhausted")]
pub struct IdExhausted;

impl TryFrom<u64> for Id {
    type Error = IdOutOfRange;
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < Self::MIN || value > Self::MAX {
            Err(IdOutOfRange::new(value))
        } else {
            Ok(Id(value))
        }
    }
}

impl From<Id> for u64 {
    fn from(value: Id) -> Self {
        value.0
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "an unsigned integer in the range [{}, {}]",
            Id::MIN,
            Id::MAX
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Id::try_from(v).map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(IdVisitor)
    }
}

/// An allocator of identifiers, unique within one scope.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    async fn generate_id(&self) -> Result<Id>;
}

/// Allocator for the global scope.
///
/// Draws uniformly over the full range, so unrelated identifiers cannot be
/// correlated by observing them.
#[derive(Default)]
pub struct RandomIdAllocator {}

#[async_trait]
impl IdAllocator for RandomIdAllocator {
    async fn generate_id(&self) -> Result<Id> {
        let id = (rand::random::<u64>() & (Id::MAX - 1)) + 1;
        Ok(Id(id))
    }
}

/// Allocator for the router scope.
///
/// Monotonic, so every identifier is unique for the lifetime of the
/// allocator. Fails with [`IdExhausted`] past the top of the range.
#[derive(Default)]
pub struct SequentialIdAllocator {
    last: Mutex<u64>,
}

#[async_trait]
impl IdAllocator for SequentialIdAllocator {
    async fn generate_id(&self) -> Result<Id> {
        let mut last = self.last.lock().await;
        if *last >= Id::MAX {
            return Err(IdExhausted.into());
        }
        *last += 1;
        Ok(Id(*last))
    }
}
