//! JSON Schema validation of function inputs and outputs.

use serde_json::Value;

use crate::error::{FunError, Result};

/// Validates values against JSON schemas.
pub trait Validator: Send + Sync {
    /// Fails with [`FunError::SchemaValidationFailed`] when `value` does not
    /// match `schema` and with [`FunError::InvalidSchema`] when the schema
    /// itself is malformed.
    fn validate(&self, schema: &Value, value: &Value) -> Result<()>;
}

/// [`Validator`] backed by the `jsonschema` crate.
///
/// The schema is compiled on every call and nothing is cached, so repeated
/// validation of the same pair always gives the same result.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaValidator;

impl Validator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<()> {
        let validator = jsonschema::validator_for(schema).map_err(|e| FunError::InvalidSchema {
            message: e.to_string(),
        })?;
        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(FunError::SchemaValidationFailed {
                message: errors.join("; "),
            })
        }
    }
}
