//! JSON Schema support for structured LLM responses.

use schemars::{JsonSchema, SchemaGenerator, r#gen::SchemaSettings};

use crate::prelude::*;

/// Build a draft-07 JSON Schema for a Rust type.
///
/// Some providers reject `definitions` in response schemas, so all
/// subschemas are inlined.
pub fn schema_for<T>() -> Value
where
    T: JsonSchema,
{
    let mut settings = SchemaSettings::draft07();
    settings.inline_subschemas = true;
    let generator = SchemaGenerator::new(settings);
    let schema = generator.into_root_schema_for::<T>();
    serde_json::to_value(schema).expect("failed to convert schema to JSON")
}

/// The `title` of a schema, defaulting to a generic name.
pub fn schema_title(schema: &Value) -> String {
    schema
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("ResponseFormat")
        .to_owned()
}

/// Compile a schema into a validator for checking LLM responses.
pub fn validator_for(schema: &Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(schema).context("failed to compile response schema")
}
