//! Serialization of staged tasks and their results.
//!
//! Everything that crosses the boundary between the submitting process and a
//! remote execution environment goes through this module: the task itself,
//! its output artifact, and the optional distributed-job descriptor. It
//! abstracts away the underlying serialization libraries and provides a
//! unified interface for the formats the crate supports.
//!
//! # Features:
//! - **Payload trait**: A shorthand trait that encapsulates the bounds a
//!   value must satisfy to be shipped to a remote environment.
//! - **Codec enum**: Provides a generic way to serialize and deserialize
//!   binary data. It supports multiple serialization formats and can be
//!   easily extended.
//! - **Staged envelopes**: [`stage`] wraps a payload in a small
//!   self-describing envelope so the remote side can select the right
//!   decoder and verify its environment before touching the payload.
//!
//! # Examples
//!
//! ```rust
//! use legate::codec::Codec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct MyData {
//!    field: String,
//! }
//!
//! let data = MyData { field: "Hello, World!".to_string() };
//! let serialized = Codec::Cbor.to_bytes(&data).unwrap();
//! let deserialized: MyData = Codec::Cbor.from_bytes(&serialized).unwrap();
//! ```

use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

pub mod by_value;

/// Represents a shorthand for the bounds a value must satisfy to be staged
/// for remote execution.
///
/// Staged values are moved across threads and across process boundaries,
/// hence the requirements for `Send`, `Sync`, and `'static`. As such, it's
/// recommended to use owned types for anything that will be staged.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Provides a unified interface for serializing and deserializing binary
/// data.
///
/// This enum abstracts away the underlying serialization libraries and
/// offers methods to serialize and deserialize data in different formats.
/// It can be easily extended to support additional serialization formats in
/// the future.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Codec {
    /// Serializes the given value into binary data using the specified
    /// format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Deserializes the given binary data into a value of the specified type
    /// using the specified format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

/// The format used for [`StagedEnvelope`]s themselves.
///
/// The envelope names the codec of its payload, so the envelope encoding must
/// be fixed up front for the remote side to have a starting point.
const ENVELOPE_CODEC: Codec = Codec::Postcard;

/// A staged payload, wrapped with the metadata a remote process needs to
/// decode it.
///
/// The `by_value` list carries the module registrations that were active when
/// the payload was serialized (see [`by_value`]): the remote side treats them
/// as a pre-flight checklist of libraries that must be importable before
/// deserialization is attempted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StagedEnvelope {
    /// The [`Codec`] that encoded `payload`.
    pub codec: Codec,
    /// Module names registered for by-value capture at staging time.
    pub by_value: Vec<String>,
    /// The serialized payload.
    pub payload: Bytes,
}

/// Serializes `value` into a [`StagedEnvelope`] with no by-value
/// registrations.
#[instrument(skip(value), level = "debug")]
pub fn stage<T: Serialize>(codec: Codec, value: &T) -> Result<Bytes> {
    let envelope = StagedEnvelope {
        codec,
        by_value: Vec::new(),
        payload: codec.to_bytes(value)?.into(),
    };
    Ok(ENVELOPE_CODEC.to_bytes(&envelope)?.into())
}

/// Serializes `value` into a [`StagedEnvelope`], holding a
/// [`by_value::ByValueScope`] for the given modules across the
/// serialization.
#[instrument(skip(value), level = "debug")]
pub fn stage_with_by_value<T: Serialize>(
    codec: Codec,
    value: &T,
    modules: &[String],
) -> Result<Bytes> {
    let scope = by_value::ByValueScope::register(modules.iter().cloned());
    let envelope = StagedEnvelope {
        codec,
        by_value: scope.modules().to_vec(),
        payload: codec.to_bytes(value)?.into(),
    };
    drop(scope);
    Ok(ENVELOPE_CODEC.to_bytes(&envelope)?.into())
}

/// Decodes a [`StagedEnvelope`] produced by [`stage`] and deserializes its
/// payload.
#[instrument(skip(bytes), level = "debug")]
pub fn load_staged<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let envelope: StagedEnvelope = ENVELOPE_CODEC.from_bytes(bytes)?;
    if !envelope.by_value.is_empty() {
        tracing::debug!(
            modules = ?envelope.by_value,
            "staged payload was serialized with by-value module registrations"
        );
    }
    envelope.codec.from_bytes(&envelope.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        label: String,
        values: Vec<u64>,
    }

    fn sample() -> Sample {
        Sample {
            label: "greetings".to_string(),
            values: vec![1, 1, 2, 3, 5, 8],
        }
    }

    #[test]
    fn round_trips_through_both_codecs() {
        for codec in [Codec::Postcard, Codec::Cbor] {
            let bytes = codec.to_bytes(&sample()).unwrap();
            let decoded: Sample = codec.from_bytes(&bytes).unwrap();
            assert_eq!(decoded, sample());
        }
    }

    #[test]
    fn staged_envelope_round_trips() {
        let bytes = stage(Codec::Cbor, &sample()).unwrap();
        let decoded: Sample = load_staged(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn staged_envelope_records_by_value_registrations() {
        let bytes =
            stage_with_by_value(Codec::Postcard, &sample(), &["my_feature_lib".to_string()])
                .unwrap();
        let envelope: StagedEnvelope = ENVELOPE_CODEC.from_bytes(&bytes).unwrap();
        assert_eq!(envelope.by_value, vec!["my_feature_lib".to_string()]);
        let decoded: Sample = load_staged(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }
}
