//! Tool input-schema sanitization.
//!
//! Providers only accept property names matching `[A-Za-z0-9_-]`. Every
//! offending character becomes `_`, recursively through `properties` and
//! `items`, and `required` lists are rewritten with the same names. The
//! renames are kept so model-produced arguments can be mapped back to the
//! names the server expects.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::inference::ToolDefinition;
use crate::mcp_client::Tool;

/// Sanitized tool plus the map needed to restore its arguments.
#[derive(Debug, Clone)]
pub struct SanitizedTool {
    pub definition: ToolDefinition,
    pub renames: RenameMap,
}

/// Sanitized property name → original, per nesting level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenameMap {
    names: HashMap<String, String>,
    nested: HashMap<String, RenameMap>,
    items: Option<Box<RenameMap>>,
}

impl RenameMap {
    /// True when no property at any depth was renamed.
    pub fn is_identity(&self) -> bool {
        self.names.iter().all(|(k, v)| k == v)
            && self.nested.values().all(RenameMap::is_identity)
            && self.items.as_ref().map_or(true, |i| i.is_identity())
    }

    /// Map sanitized argument keys back to the original property names.
    pub fn restore(&self, value: Value) -> Value {
        match value {
            Value::Object(object) => {
                let mut restored = Map::with_capacity(object.len());
                for (key, inner) in object {
                    let inner = match self.nested.get(&key) {
                        Some(nested) => nested.restore(inner),
                        None => inner,
                    };
                    let original = self.names.get(&key).cloned().unwrap_or(key);
                    restored.insert(original, inner);
                }
                Value::Object(restored)
            }
            Value::Array(values) => match &self.items {
                Some(items) => Value::Array(values.into_iter().map(|v| items.restore(v)).collect()),
                None => Value::Array(values),
            },
            other => other,
        }
    }

    fn sanitized_name(&self, original: &str) -> Option<String> {
        self.names
            .iter()
            .find(|(_, o)| o.as_str() == original)
            .map(|(s, _)| s.clone())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_property_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitize a tool's input schema and build its provider definition.
pub fn sanitize_tool(tool: &Tool) -> SanitizedTool {
    let (input_schema, renames) = sanitize_input_schema(&tool.input_schema);
    SanitizedTool {
        definition: ToolDefinition {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            input_schema,
        },
        renames,
    }
}

/// Sanitize a top-level input schema. The result always carries a `type`
/// (default `"object"`), and an object schema always carries `properties`.
pub fn sanitize_input_schema(schema: &Value) -> (Value, RenameMap) {
    let mut object = match schema {
        Value::Object(object) => object.clone(),
        _ => Map::new(),
    };
    object
        .entry("type")
        .or_insert_with(|| Value::String("object".into()));

    let mut sanitized = Value::Object(object);
    let renames = sanitize_node(&mut sanitized);
    (sanitized, renames)
}

fn sanitize_node(schema: &mut Value) -> RenameMap {
    let mut renames = RenameMap::default();
    let Value::Object(object) = schema else {
        return renames;
    };

    if is_object_schema(object) {
        let properties = match object.remove("properties") {
            Some(Value::Object(properties)) => properties,
            _ => Map::new(),
        };

        let mut sanitized = Map::with_capacity(properties.len());
        for (original, mut property) in properties {
            let name = unique_name(sanitize_property_name(&original), &sanitized);
            let nested = sanitize_node(&mut property);
            if nested != RenameMap::default() {
                renames.nested.insert(name.clone(), nested);
            }
            renames.names.insert(name.clone(), original);
            sanitized.insert(name, property);
        }
        object.insert("properties".into(), Value::Object(sanitized));

        if let Some(Value::Array(required)) = object.get_mut("required") {
            for entry in required.iter_mut() {
                if let Some(original) = entry.as_str() {
                    if let Some(name) = renames.sanitized_name(original) {
                        *entry = Value::String(name);
                    }
                }
            }
        }
    }

    if let Some(items) = object.get_mut("items") {
        let nested = sanitize_node(items);
        if nested != RenameMap::default() {
            renames.items = Some(Box::new(nested));
        }
    }

    renames
}

fn is_object_schema(object: &Map<String, Value>) -> bool {
    match object.get("type") {
        Some(Value::String(t)) => t == "object",
        Some(Value::Array(types)) => types.iter().any(|t| t == "object"),
        None => object.contains_key("properties"),
        _ => false,
    }
}

/// `a b` and `a_b` both sanitize to `a_b`; suffix the later one.
fn unique_name(candidate: String, taken: &Map<String, Value>) -> String {
    if !taken.contains_key(&candidate) {
        return candidate;
    }
    let mut n = 2;
    loop {
        let name = format!("{candidate}_{n}");
        if !taken.contains_key(&name) {
            return name;
        }
        n += 1;
    }
}
