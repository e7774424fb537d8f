//! Client-side half of the handle codec.
//!
//! Arguments arrive as `WireValue`s and are turned into `EngineValue`s by
//! resolving every handle (at any nesting depth) to its live object. Results
//! go the other way: objects get registered and replaced by their handles.

use crate::engine::{Engine, EngineError, EngineValue};
use crate::error::ProtocolError;
use crate::protocol::{BaseValue, WireValue};

use super::registry::Registry;

/// Resolve wire arguments into native engine values.
pub fn decode_args<E: Engine>(
    registry: &Registry<E::Object>,
    args: Vec<WireValue>,
) -> Result<Vec<EngineValue<E::Object>>, ProtocolError> {
    args.into_iter()
        .map(|arg| decode_value::<E>(registry, arg))
        .collect()
}

fn decode_value<E: Engine>(
    registry: &Registry<E::Object>,
    value: WireValue,
) -> Result<EngineValue<E::Object>, ProtocolError> {
    match value {
        WireValue::Base(base) => Ok(EngineValue::Base(base)),
        WireValue::Handle(handle) => registry.get(handle.id).cloned().map(EngineValue::Object),
        WireValue::List(items) => items
            .into_iter()
            .map(|item| decode_value::<E>(registry, item))
            .collect::<Result<Vec<_>, _>>()
            .map(EngineValue::List),
    }
}

/// Classify an engine result for the wire, registering any new objects.
///
/// A result holding a NaN or infinite float has no JSON form; it is
/// rejected before anything in it is registered.
pub fn encode_result<E: Engine>(
    engine: &E,
    registry: &mut Registry<E::Object>,
    value: EngineValue<E::Object>,
) -> Result<WireValue, EngineError> {
    if let Some(v) = first_non_finite(&value) {
        return Err(EngineError::UnsupportedType(format!("non-finite float {}", v)));
    }
    Ok(encode_value(engine, registry, value))
}

fn first_non_finite<O>(value: &EngineValue<O>) -> Option<f64> {
    match value {
        EngineValue::Base(BaseValue::Float(v)) if !v.is_finite() => Some(*v),
        EngineValue::List(items) => items.iter().find_map(first_non_finite),
        _ => None,
    }
}

fn encode_value<E: Engine>(
    engine: &E,
    registry: &mut Registry<E::Object>,
    value: EngineValue<E::Object>,
) -> WireValue {
    match value {
        EngineValue::Base(base) => WireValue::Base(base),
        EngineValue::Object(object) => {
            let identity = engine.identity(&object);
            let display = engine.describe(&object);
            WireValue::Handle(registry.register(object, identity, move || display))
        }
        EngineValue::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|item| encode_value(engine, registry, item))
                .collect(),
        ),
    }
}
