//! Administrative operations as JSON method calls.
//!
//! Parameters are deserialized from `serde_json::Value` and results are
//! returned as values; the transport is left to the embedding application.

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::AccelError;
use crate::framework::Accel;
use crate::keyring::CryptoKeyCreateParams;

pub const METHOD_ASSIGN_OPC: &str = "accel_assign_opc";
pub const METHOD_CRYPTO_KEY_CREATE: &str = "accel_crypto_key_create";
pub const METHOD_CRYPTO_KEY_DESTROY: &str = "accel_crypto_key_destroy";
pub const METHOD_GET_OPC_ASSIGNMENTS: &str = "accel_get_opc_assignments";
pub const METHOD_GET_MODULE_INFO: &str = "accel_get_module_info";
pub const METHOD_CRYPTO_KEYS_GET: &str = "accel_crypto_keys_get";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignOpcParams {
    pub opname: String,
    pub module: String,
}

/// `accel_crypto_key_create` parameters: the key fields plus an optional
/// module name.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoKeyCreateRequest {
    pub cipher: Option<String>,
    pub key: Option<String>,
    pub key2: Option<String>,
    pub name: Option<String>,
    pub driver: Option<String>,
    pub module: Option<String>,
}

impl CryptoKeyCreateRequest {
    /// Splits the request into the target module and the key parameters.
    #[must_use]
    pub fn into_parts(self) -> (Option<String>, CryptoKeyCreateParams) {
        let params = CryptoKeyCreateParams {
            cipher: self.cipher,
            key: self.key,
            key2: self.key2,
            name: self.name,
            driver: self.driver,
        };
        (self.module, params)
    }
}

impl fmt::Debug for CryptoKeyCreateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKeyCreateRequest")
            .field("name", &self.name)
            .field("cipher", &self.cipher)
            .field("driver", &self.driver)
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoKeyDestroyParams {
    pub key_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoKeysGetParams {
    pub key_name: Option<String>,
}

fn parse<T: for<'de> Deserialize<'de>>(method: &str, params: Value) -> Result<T, AccelError> {
    serde_json::from_value(params)
        .map_err(|e| AccelError::InvalidArgument(format!("{method}: {e}")))
}

/// Executes one administrative method against `accel`.
///
/// `params` may be `Value::Null` for methods that take none.
///
/// # Errors
///
/// Returns [`AccelError::InvalidArgument`] for malformed parameters,
/// [`AccelError::NotFound`] for an unknown method, or the error of the
/// underlying operation.
pub fn dispatch(accel: &Accel, method: &str, params: Value) -> Result<Value, AccelError> {
    debug!(method, "accel rpc");
    match method {
        METHOD_ASSIGN_OPC => {
            let p: AssignOpcParams = parse(method, params)?;
            accel.assign_opcode_by_name(&p.opname, &p.module)?;
            Ok(Value::Bool(true))
        }
        METHOD_CRYPTO_KEY_CREATE => {
            let (module, key) = parse::<CryptoKeyCreateRequest>(method, params)?.into_parts();
            accel.crypto_key_create(module.as_deref(), &key)?;
            Ok(Value::Bool(true))
        }
        METHOD_CRYPTO_KEY_DESTROY => {
            let p: CryptoKeyDestroyParams = parse(method, params)?;
            let key = accel
                .crypto_key_get(&p.key_name)
                .ok_or_else(|| AccelError::NotFound(format!("crypto key {}", p.key_name)))?;
            accel.crypto_key_destroy(&key)?;
            Ok(Value::Bool(true))
        }
        METHOD_GET_OPC_ASSIGNMENTS => {
            let map: serde_json::Map<String, Value> = accel
                .opcode_assignments()
                .into_iter()
                .map(|(op, module)| (op.name().to_string(), Value::String(module)))
                .collect();
            Ok(Value::Object(map))
        }
        METHOD_GET_MODULE_INFO => Ok(json!(accel.module_info())),
        METHOD_CRYPTO_KEYS_GET => {
            let p: CryptoKeysGetParams = if params.is_null() {
                CryptoKeysGetParams::default()
            } else {
                parse(method, params)?
            };
            Ok(json!(accel.crypto_keys_info(p.key_name.as_deref())?))
        }
        other => Err(AccelError::NotFound(format!("method {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use offload_core::Opcode;

    use super::*;
    use crate::config::AccelConfig;
    use crate::module::AccelModule;
    use crate::testing::MockModule;

    fn accel_with_crypto() -> Accel {
        let accel = Accel::with_software_module(AccelConfig::default());
        let qat: Arc<dyn AccelModule> = MockModule::new("qat", &[Opcode::Encrypt, Opcode::Decrypt])
            .with_crypto_keys()
            .into_arc();
        accel.register_module(qat).unwrap();
        accel
    }

    #[test]
    fn assign_opc_then_query_assignments() {
        let accel = accel_with_crypto();
        dispatch(
            &accel,
            METHOD_ASSIGN_OPC,
            json!({"opname": "encrypt", "module": "software"}),
        )
        .unwrap();
        accel.start().unwrap();

        let assignments = dispatch(&accel, METHOD_GET_OPC_ASSIGNMENTS, Value::Null).unwrap();
        assert_eq!(assignments["encrypt"], "software");
        assert_eq!(assignments["decrypt"], "qat");
        assert_eq!(assignments["copy"], "software");
    }

    #[test]
    fn assign_opc_rejects_unknown_opcode_and_fields() {
        let accel = accel_with_crypto();
        assert!(matches!(
            dispatch(&accel, METHOD_ASSIGN_OPC, json!({"opname": "xor", "module": "software"})),
            Err(AccelError::InvalidArgument(_))
        ));
        assert!(matches!(
            dispatch(&accel, METHOD_ASSIGN_OPC, json!({"opname": "copy"})),
            Err(AccelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn key_create_get_destroy() {
        let accel = accel_with_crypto();
        accel.start().unwrap();

        dispatch(
            &accel,
            METHOD_CRYPTO_KEY_CREATE,
            json!({"name": "k", "cipher": "AES_XTS", "key": "0011", "key2": "2233", "module": "qat"}),
        )
        .unwrap();

        let keys = dispatch(&accel, METHOD_CRYPTO_KEYS_GET, Value::Null).unwrap();
        assert_eq!(keys[0]["name"], "k");
        assert_eq!(keys[0]["module"], "qat");
        assert_eq!(keys[0]["key2"], "2233");

        dispatch(&accel, METHOD_CRYPTO_KEY_DESTROY, json!({"key_name": "k"})).unwrap();
        assert!(matches!(
            dispatch(&accel, METHOD_CRYPTO_KEY_DESTROY, json!({"key_name": "k"})),
            Err(AccelError::NotFound(_))
        ));
        assert!(matches!(
            dispatch(&accel, METHOD_CRYPTO_KEYS_GET, json!({"key_name": "k"})),
            Err(AccelError::NotFound(_))
        ));
    }

    #[test]
    fn key_create_missing_cipher_is_invalid() {
        let accel = accel_with_crypto();
        accel.start().unwrap();
        let err = dispatch(
            &accel,
            METHOD_CRYPTO_KEY_CREATE,
            json!({"name": "k", "key": "00"}),
        )
        .unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));
    }

    #[test]
    fn key_create_rejects_unknown_fields() {
        let accel = accel_with_crypto();
        accel.start().unwrap();
        let err = dispatch(
            &accel,
            METHOD_CRYPTO_KEY_CREATE,
            json!({"name": "k", "cipher": "AES_CBC", "key": "00", "tweak_mode": "simple"}),
        )
        .unwrap_err();
        assert!(matches!(err, AccelError::InvalidArgument(_)));
        assert!(accel.crypto_key_get("k").is_none());
    }

    #[test]
    fn key_create_request_debug_hides_material() {
        let req: CryptoKeyCreateRequest = serde_json::from_value(
            json!({"name": "k", "cipher": "AES_CBC", "key": "deadbeef", "module": "qat"}),
        )
        .unwrap();
        let shown = format!("{req:?}");
        assert!(shown.contains("qat"));
        assert!(!shown.contains("deadbeef"));
        let (module, params) = req.into_parts();
        assert_eq!(module.as_deref(), Some("qat"));
        assert_eq!(params.key.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn module_info_lists_registration_order() {
        let accel = accel_with_crypto();
        let info = dispatch(&accel, METHOD_GET_MODULE_INFO, Value::Null).unwrap();
        assert_eq!(info[0]["module"], "software");
        assert_eq!(info[1]["module"], "qat");
        assert_eq!(info[1]["supported_opcodes"], json!(["encrypt", "decrypt"]));
    }

    #[test]
    fn unknown_method_is_not_found() {
        let accel = accel_with_crypto();
        assert!(matches!(
            dispatch(&accel, "accel_bogus", Value::Null),
            Err(AccelError::NotFound(_))
        ));
    }
}
