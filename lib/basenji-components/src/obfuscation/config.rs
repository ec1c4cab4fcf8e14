//! Obfuscation configuration types.

use serde::Deserialize;

/// Configuration for the obfuscator.
///
/// Read from the `obfuscation` section of the agent configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// SQL obfuscation settings.
    sql: SqlObfuscationConfig,

    /// HTTP URL obfuscation settings.
    http: HttpObfuscationConfig,

    /// MongoDB obfuscation settings.
    #[serde(alias = "mongodb")]
    mongo: JsonObfuscationConfig,

    /// Elasticsearch obfuscation settings.
    #[serde(alias = "elasticsearch")]
    es: JsonObfuscationConfig,
}

/// SQL obfuscation configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SqlObfuscationConfig {
    /// Whether SQL and Cassandra resources are obfuscated.
    pub(crate) enabled: bool,
}

impl Default for SqlObfuscationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// HTTP URL obfuscation configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HttpObfuscationConfig {
    /// Whether to remove query strings from HTTP URLs.
    pub(crate) remove_query_string: bool,

    /// Whether to obfuscate path segments containing digits.
    #[serde(alias = "remove_paths_with_digits")]
    pub(crate) remove_path_digits: bool,
}

/// JSON obfuscation configuration for MongoDB and Elasticsearch.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JsonObfuscationConfig {
    /// Whether JSON obfuscation is enabled.
    pub(crate) enabled: bool,

    /// Keys whose values should not be obfuscated.
    pub(crate) keep_values: Vec<String>,

    /// Keys whose string values should be SQL-obfuscated instead of replaced with "?".
    pub(crate) obfuscate_sql_values: Vec<String>,
}

impl ObfuscationConfig {
    /// Returns the SQL settings.
    pub fn sql(&self) -> &SqlObfuscationConfig {
        &self.sql
    }

    /// Returns the HTTP settings.
    pub fn http(&self) -> &HttpObfuscationConfig {
        &self.http
    }

    /// Returns the MongoDB settings.
    pub fn mongo(&self) -> &JsonObfuscationConfig {
        &self.mongo
    }

    /// Returns the Elasticsearch settings.
    pub fn es(&self) -> &JsonObfuscationConfig {
        &self.es
    }

    /// Replaces the SQL settings.
    pub fn with_sql(mut self, sql: SqlObfuscationConfig) -> Self {
        self.sql = sql;
        self
    }

    /// Replaces the HTTP settings.
    pub fn with_http(mut self, http: HttpObfuscationConfig) -> Self {
        self.http = http;
        self
    }

    /// Replaces the MongoDB settings.
    pub fn with_mongo(mut self, mongo: JsonObfuscationConfig) -> Self {
        self.mongo = mongo;
        self
    }

    /// Replaces the Elasticsearch settings.
    pub fn with_es(mut self, es: JsonObfuscationConfig) -> Self {
        self.es = es;
        self
    }
}

impl SqlObfuscationConfig {
    /// Creates a new `SqlObfuscationConfig`.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Returns `true` if this kind of obfuscation is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl HttpObfuscationConfig {
    /// Creates a new `HttpObfuscationConfig`.
    pub fn new(remove_query_string: bool, remove_path_digits: bool) -> Self {
        Self {
            remove_query_string,
            remove_path_digits,
        }
    }

    /// Returns `true` if query strings are removed.
    pub fn remove_query_string(&self) -> bool {
        self.remove_query_string
    }

    /// Returns `true` if path segments with digits are obfuscated.
    pub fn remove_path_digits(&self) -> bool {
        self.remove_path_digits
    }
}

impl JsonObfuscationConfig {
    /// Creates an enabled `JsonObfuscationConfig` keeping the values of the given keys.
    pub fn enabled_with_keep_values<S: Into<String>>(keep_values: impl IntoIterator<Item = S>) -> Self {
        Self {
            enabled: true,
            keep_values: keep_values.into_iter().map(Into::into).collect(),
            obfuscate_sql_values: Vec::new(),
        }
    }

    /// Returns `true` if this kind of obfuscation is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the keys whose values are kept.
    pub fn keep_values(&self) -> &[String] {
        &self.keep_values
    }

    /// Returns the keys whose values are SQL-obfuscated.
    pub fn obfuscate_sql_values(&self) -> &[String] {
        &self.obfuscate_sql_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: ObfuscationConfig = serde_json::from_str(
            r#"{"http": {"remove_paths_with_digits": true}, "elasticsearch": {"enabled": true, "keep_values": ["id"]}}"#,
        )
        .unwrap();

        assert!(config.sql().enabled());
        assert!(config.http().remove_path_digits());
        assert!(!config.http().remove_query_string());
        assert!(config.es().enabled());
        assert_eq!(config.es().keep_values(), ["id".to_string()]);
        assert!(!config.mongo().enabled());
    }
}
