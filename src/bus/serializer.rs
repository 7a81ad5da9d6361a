//! Payload encodings for the message bus
//!
//! Payloads are self-describing MessagePack maps (field name to value). Timestamps
//! are ISO-8601 strings; enums are encoded as their integer discriminant.

use crate::error::{BusError, DecodeError};
use crate::messages::{AnalysisMsg, MonitorMsg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Encodes a typed message to bytes and back
pub trait Serializer<M>: Send + Sync {
    fn serialize(&self, msg: &M) -> Result<Vec<u8>, BusError>;

    fn deserialize(&self, data: &[u8]) -> Result<M, DecodeError>;
}

/// A message type that can travel on the bus
///
/// `validate` runs after decoding so structurally valid payloads that break a
/// type invariant are rejected as well.
pub trait WireMessage: Serialize + DeserializeOwned {
    fn validate(&self) -> Result<(), DecodeError> {
        Ok(())
    }
}

impl WireMessage for AnalysisMsg {
    fn validate(&self) -> Result<(), DecodeError> {
        AnalysisMsg::validate(self)
    }
}

impl WireMessage for MonitorMsg {}

/// MessagePack map encoding for any [`WireMessage`]
///
/// Struct fields are written by name, so a payload decodes without knowing the field
/// order it was written in.
pub struct MsgpackSerializer<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> MsgpackSerializer<M> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Default for MsgpackSerializer<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: WireMessage> Serializer<M> for MsgpackSerializer<M> {
    fn serialize(&self, msg: &M) -> Result<Vec<u8>, BusError> {
        rmp_serde::to_vec_named(msg).map_err(|e| BusError::Encode(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<M, DecodeError> {
        let msg: M = rmp_serde::from_slice(data)?;
        msg.validate()?;
        Ok(msg)
    }
}

/// Pass-through encoding for payloads that are already bytes (e.g. encoded frames)
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesSerializer;

impl Serializer<Vec<u8>> for RawBytesSerializer {
    fn serialize(&self, msg: &Vec<u8>) -> Result<Vec<u8>, BusError> {
        Ok(msg.clone())
    }

    fn deserialize(&self, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(data.to_vec())
    }
}
