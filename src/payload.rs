// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Contracts
//!
//! A payload is the structured value carried in a message body. Each exchange
//! binds exactly one payload type, its *payload contract*, and both the
//! publisher and the consumer handler are checked against it.
//!
//! Values are attached from a string-keyed map by field name: keys the type
//! does not declare are ignored and missing keys keep the type's defaults. The
//! field set is the one serde derives for the type, so no runtime reflection is
//! involved.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::any::{type_name, Any, TypeId};

/// String keyed map messages are decoded into.
pub type PayloadMap = Map<String, Value>;

/// Identity of a payload type.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContract {
    type_id: TypeId,
    name: &'static str,
}

impl PartialEq for PayloadContract {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for PayloadContract {}

impl PayloadContract {
    /// Contract of the payload type `P`.
    pub fn of<P: Payload>() -> Self {
        PayloadContract {
            type_id: TypeId::of::<P>(),
            name: type_name::<P>(),
        }
    }

    /// Type name, for error messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True when `value`'s runtime type is the contract's payload type.
    pub fn is_instance(&self, value: &dyn Any) -> bool {
        value.type_id() == self.type_id
    }
}

/// A message body schema.
///
/// The defaults cover plain serde structs. Types that own a specific JSON shape
/// override [`Payload::encode`].
pub trait Payload: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Declared field names.
    fn fields() -> Vec<String> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => vec![],
        }
    }

    /// Copies the known keys of `values` onto `self`.
    fn attach_values(&mut self, values: &PayloadMap) -> Result<(), AmqpError> {
        attach_values(self, values)
    }

    /// Field name to value map.
    fn export_values(&self) -> Result<PayloadMap, AmqpError> {
        export_values(self)
    }

    /// Wire body.
    fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(&self.export_values()?)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }

    /// Builds a default instance and attaches `values` onto it.
    fn from_values(values: &PayloadMap) -> Result<Self, AmqpError> {
        let mut payload = Self::default();
        payload.attach_values(values)?;
        Ok(payload)
    }
}

/// Partial update of a serde struct from a map. Works for payloads and for the
/// declaration descriptors alike.
pub fn attach_values<T>(target: &mut T, values: &PayloadMap) -> Result<(), AmqpError>
where
    T: Serialize + DeserializeOwned,
{
    let mut current = export_values(target)?;

    for (key, value) in values {
        if let Some(slot) = current.get_mut(key) {
            *slot = value.clone();
        }
    }

    *target = serde_json::from_value(Value::Object(current))
        .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;

    Ok(())
}

/// Serializes `source` into its field map.
pub fn export_values<T: Serialize>(source: &T) -> Result<PayloadMap, AmqpError> {
    match serde_json::to_value(source) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AmqpError::ParsePayloadError(
            "payload must serialize to an object".to_owned(),
        )),
        Err(err) => Err(AmqpError::ParsePayloadError(err.to_string())),
    }
}

/// Decodes a message body into a map. Empty, invalid, or non-object bodies
/// decode to an empty map.
pub fn decode_body(body: &[u8]) -> PayloadMap {
    if body.is_empty() {
        return PayloadMap::new();
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => PayloadMap::new(),
    }
}
