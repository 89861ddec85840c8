//! Device descriptor advertised on server request.

use serde_json::json;

use crate::core::{DeviceIdentity, ProtocolError};
use crate::rpc::registry::Registries;

/// Uri-Query flags requesting the full descriptor (SYSTEM | APPLICATION).
pub const DESCRIBE_FULL: u8 = 3;

/// Uri-Query flags requesting the 1-byte diagnostic payload.
pub const DESCRIBE_METRICS: u8 = 4;

/// Build the JSON descriptor enumerating functions, files, variables, and
/// firmware metadata.
pub fn descriptor(registries: &Registries, identity: &DeviceIdentity) -> serde_json::Value {
    let functions: Vec<serde_json::Value> = registries
        .function_names()
        .into_iter()
        .map(serde_json::Value::from)
        .collect();

    let mut files = serde_json::Map::new();
    for (name, mime) in registries.file_mimes() {
        files.insert(name, json!([mime, serde_json::Value::Null]));
    }

    let mut variables = serde_json::Map::new();
    for (name, kind) in registries.variable_kinds() {
        variables.insert(name, serde_json::Value::from(kind.as_str()));
    }

    let version = identity.product_firmware_version.to_string();
    json!({
        "f": functions,
        "g": files,
        "m": [
            { "d": [], "f": "b", "n": "0", "v": "0" },
            { "d": [], "f": "s", "n": "1", "v": version },
            { "d": [], "f": "u", "n": "1", "v": version },
        ],
        "p": identity.platform_id,
        "v": variables,
    })
}

/// Serialize the descriptor for the wire.
pub fn descriptor_payload(
    registries: &Registries,
    identity: &DeviceIdentity,
) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(&descriptor(registries, identity))
        .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
}

/// The 1-byte diagnostic payload answered to a metrics Describe.
pub fn metrics_payload() -> Vec<u8> {
    vec![0]
}

/// Select the payload for the given descriptor flags.
pub fn payload_for_flags(
    flags: u8,
    registries: &Registries,
    identity: &DeviceIdentity,
) -> Result<Vec<u8>, ProtocolError> {
    match flags {
        DESCRIBE_FULL => descriptor_payload(registries, identity),
        DESCRIBE_METRICS => Ok(metrics_payload()),
        other => Err(ProtocolError::BadDescribeFlags(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::FunctionFlags;
    use crate::rpc::value::{VariableKind, VariableValue};
    use std::sync::Arc;

    fn populated() -> Registries {
        let mut reg = Registries::new();
        reg.register_function("reset", FunctionFlags::default(), Arc::new(|_| {
            Box::pin(async { Ok(0) })
        }));
        reg.register_variable(
            "temp",
            VariableKind::Double,
            Arc::new(|_| Box::pin(async { Ok(VariableValue::Double(0.0)) })),
        );
        reg.register_file(
            "config",
            "application/json",
            Arc::new(|_| Box::pin(async { Ok(vec![]) })),
        );
        reg
    }

    #[test]
    fn descriptor_lists_registrations() {
        let identity = DeviceIdentity::new("000102030405060708090a0b", 9, 3, 6).unwrap();
        let doc = descriptor(&populated(), &identity);

        assert_eq!(doc["f"], serde_json::json!(["reset"]));
        assert_eq!(doc["g"]["config"][0], "application/json");
        assert_eq!(doc["v"]["temp"], "double");
        assert_eq!(doc["p"], 6);
        assert_eq!(doc["m"][1]["f"], "s");
        assert_eq!(doc["m"][1]["v"], "3");
    }

    #[test]
    fn flag_selection() {
        let identity = DeviceIdentity::new("000102030405060708090a0b", 0, 0, 0).unwrap();
        let reg = populated();

        assert_eq!(
            payload_for_flags(DESCRIBE_METRICS, &reg, &identity).unwrap(),
            vec![0]
        );
        assert!(payload_for_flags(DESCRIBE_FULL, &reg, &identity).is_ok());
        assert!(matches!(
            payload_for_flags(7, &reg, &identity),
            Err(ProtocolError::BadDescribeFlags(7))
        ));
    }
}
