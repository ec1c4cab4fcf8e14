//! JSON obfuscation for MongoDB and Elasticsearch queries.

use basenji_common::collections::FastHashSet;
use serde_json::{Map, Value};

use super::config::JsonObfuscationConfig;
use super::sql::obfuscate_sql_string;

/// Pre-initialized JSON obfuscator.
pub struct JsonObfuscator {
    keep_keys: FastHashSet<String>,
    sql_keys: FastHashSet<String>,
}

impl JsonObfuscator {
    /// Creates a new JSON obfuscator.
    pub fn new(config: &JsonObfuscationConfig) -> Self {
        Self {
            keep_keys: config.keep_values().iter().cloned().collect(),
            sql_keys: config.obfuscate_sql_values().iter().cloned().collect(),
        }
    }

    /// Obfuscates a JSON string by replacing every scalar with "?", except under keys listed in `keep_values`.
    ///
    /// Input that is not valid JSON is returned unchanged.
    pub fn obfuscate(&self, json_str: &str) -> String {
        if json_str.is_empty() {
            return String::new();
        }

        let value: Value = match serde_json::from_str(json_str) {
            Ok(v) => v,
            Err(_) => return json_str.to_string(),
        };

        let obfuscated = self.obfuscate_value(value, None);
        serde_json::to_string(&obfuscated).unwrap_or_else(|_| json_str.to_string())
    }

    fn obfuscate_value(&self, value: Value, current_key: Option<&str>) -> Value {
        if let Some(key) = current_key {
            if self.keep_keys.contains(key) {
                return value;
            }

            if self.sql_keys.contains(key) {
                if let Value::String(s) = &value {
                    if let Ok(obfuscated) = obfuscate_sql_string(s) {
                        return Value::String(obfuscated);
                    }
                }
            }
        }

        match value {
            Value::Object(map) => {
                let mut new_map = Map::new();
                for (key, val) in map {
                    let obfuscated_val = self.obfuscate_value(val, Some(&key));
                    new_map.insert(key, obfuscated_val);
                }
                Value::Object(new_map)
            }
            // Array elements inherit the key of the array, so kept arrays stay whole.
            Value::Array(arr) => Value::Array(arr.into_iter().map(|v| self.obfuscate_value(v, current_key)).collect()),
            Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => Value::String("?".to_string()),
        }
    }
}
