use std::fmt;
use std::path::Path;

use crate::error::AppError;

/// A compiled JSON Schema that hydrated records must satisfy.
pub struct RecordSchema {
    pub name: String,
    pub schema: serde_json::Value,
    validator: jsonschema::Validator,
}

impl fmt::Debug for RecordSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSchema")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Result<Self, AppError> {
        let name = name.into();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| AppError::SchemaError(format!("Invalid JSON Schema '{name}': {e}")))?;
        Ok(Self {
            name,
            schema,
            validator,
        })
    }

    /// The built-in product record schema.
    pub fn product() -> Result<Self, AppError> {
        Self::new("product", product_schema())
    }

    /// Load a schema from a JSON file; the name is the file stem.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let schema_str = std::fs::read_to_string(path).map_err(|e| {
            AppError::SchemaError(format!(
                "Failed to read schema file {}: {e}",
                path.display()
            ))
        })?;

        let schema: serde_json::Value = serde_json::from_str(&schema_str).map_err(|e| {
            AppError::SchemaError(format!(
                "Invalid JSON in schema file {}: {e}",
                path.display()
            ))
        })?;

        Self::new(derive_schema_name(path), schema)
    }

    /// Validate a record, reporting every violation at once.
    pub fn validate(&self, record: &serde_json::Value) -> Result<(), AppError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(record)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::SchemaValidationError(errors.join("; ")))
        }
    }
}

/// Derive a schema name from a file path.
///
/// Extracts the file stem (name without extension).
/// Example: `"schemas/product.json"` → `"product"`
pub fn derive_schema_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}

/// Product record schema in OpenAI strict structured-output form: every
/// property required, absence expressed as `null`.
pub fn product_schema() -> serde_json::Value {
    let nullable_string = serde_json::json!({"type": ["string", "null"]});
    let nullable_number = serde_json::json!({"type": ["number", "null"]});
    let string_list = serde_json::json!({"type": "array", "items": {"type": "string"}});

    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "name", "price", "description", "key_features", "image_urls",
            "video_url", "category", "brand", "colors", "variants"
        ],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "price": {
                "type": "object",
                "additionalProperties": false,
                "required": ["price", "currency", "compare_at_price"],
                "properties": {
                    "price": {"type": "number", "minimum": 0},
                    "currency": {"type": "string", "minLength": 1},
                    "compare_at_price": nullable_number
                }
            },
            "description": {"type": "string"},
            "key_features": string_list,
            "image_urls": string_list,
            "video_url": nullable_string,
            "category": {
                "type": "object",
                "additionalProperties": false,
                "required": ["name"],
                "properties": {"name": {"type": "string"}}
            },
            "brand": {"type": "string"},
            "colors": string_list,
            "variants": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["sku", "color", "size", "price", "image_url"],
                    "properties": {
                        "sku": nullable_string,
                        "color": nullable_string,
                        "size": nullable_string,
                        "price": nullable_number,
                        "image_url": nullable_string
                    }
                }
            }
        }
    })
}
