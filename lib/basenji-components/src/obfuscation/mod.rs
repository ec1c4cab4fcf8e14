//! Span obfuscation.
//!
//! Sensitive values are scrubbed from spans based on their type: SQL and Cassandra resources have literals replaced,
//! Redis commands lose their arguments, HTTP URLs lose credentials (and optionally query strings and numeric path
//! segments), and MongoDB/Elasticsearch JSON bodies have their scalar values replaced. Obfuscating an already
//! obfuscated span leaves it unchanged.

use basenji_core::Span;
use metrics::counter;
use tracing::debug;

mod config;
pub use self::config::{HttpObfuscationConfig, JsonObfuscationConfig, ObfuscationConfig, SqlObfuscationConfig};

mod http;
use self::http::obfuscate_url;

mod json;
use self::json::JsonObfuscator;

mod redis;
use self::redis::{quantize_redis_string, remove_redis_args};

mod sql;
pub use self::sql::NON_PARSABLE_SQL;
use self::sql::obfuscate_sql_string;

mod sql_tokenizer;

/// Span tags read or written by the obfuscator.
pub mod tags {
    /// Full URL of an HTTP request.
    pub const HTTP_URL: &str = "http.url";

    /// Obfuscated SQL query.
    pub const SQL_QUERY: &str = "sql.query";

    /// Raw Redis command, as sent by the client.
    pub const REDIS_RAW_COMMAND: &str = "redis.raw_command";

    /// MongoDB query document.
    pub const MONGODB_QUERY: &str = "mongodb.query";

    /// Elasticsearch request body.
    pub const ELASTIC_BODY: &str = "elasticsearch.body";
}

/// Obfuscates spans in place.
pub struct Obfuscator {
    config: ObfuscationConfig,
    mongo_obfuscator: Option<JsonObfuscator>,
    es_obfuscator: Option<JsonObfuscator>,
}

impl Obfuscator {
    /// Creates a new `Obfuscator` with the given configuration.
    pub fn new(config: ObfuscationConfig) -> Self {
        let mongo_obfuscator = config.mongo().enabled().then(|| JsonObfuscator::new(config.mongo()));
        let es_obfuscator = config.es().enabled().then(|| JsonObfuscator::new(config.es()));

        Self {
            config,
            mongo_obfuscator,
            es_obfuscator,
        }
    }

    /// Returns the configuration this obfuscator was built from.
    pub fn config(&self) -> &ObfuscationConfig {
        &self.config
    }

    /// Obfuscates a single span according to its type.
    pub fn obfuscate_span(&self, span: &mut Span) {
        match span.type_() {
            "http" | "web" => self.obfuscate_http(span),
            "sql" | "cassandra" if self.config.sql().enabled() => self.obfuscate_sql(span),
            "redis" => self.obfuscate_redis(span),
            "mongodb" => {
                if let Some(obfuscator) = &self.mongo_obfuscator {
                    obfuscate_json_tag(obfuscator, span, tags::MONGODB_QUERY);
                }
            }
            "elasticsearch" => {
                if let Some(obfuscator) = &self.es_obfuscator {
                    obfuscate_json_tag(obfuscator, span, tags::ELASTIC_BODY);
                }
            }
            _ => {}
        }
    }

    fn obfuscate_http(&self, span: &mut Span) {
        let Some(url) = span.meta().get(tags::HTTP_URL) else {
            return;
        };
        if let Some(obfuscated) = obfuscate_url(url, self.config.http()) {
            span.meta_mut().insert(tags::HTTP_URL.to_string(), obfuscated);
        }
    }

    fn obfuscate_sql(&self, span: &mut Span) {
        let resource = span.resource();
        if resource.is_empty() || resource == NON_PARSABLE_SQL {
            return;
        }

        let obfuscated = match obfuscate_sql_string(resource) {
            Ok(query) if !query.is_empty() => query,
            Ok(_) => NON_PARSABLE_SQL.to_string(),
            Err(e) => {
                debug!(error = %e, span_id = span.span_id(), "Failed to obfuscate SQL query.");
                counter!("obfuscator_sql_errors_total").increment(1);
                NON_PARSABLE_SQL.to_string()
            }
        };

        span.meta_mut().insert(tags::SQL_QUERY.to_string(), obfuscated.clone());
        span.set_resource(obfuscated);
    }

    fn obfuscate_redis(&self, span: &mut Span) {
        // The raw command carries the arguments when present; otherwise the resource does.
        let source = match span.meta().get(tags::REDIS_RAW_COMMAND) {
            Some(raw) if !raw.trim().is_empty() => raw.as_str(),
            _ => span.resource(),
        };

        let stripped = remove_redis_args(source);
        if stripped.is_empty() {
            return;
        }
        let resource = quantize_redis_string(source);

        span.meta_mut().insert(tags::REDIS_RAW_COMMAND.to_string(), stripped);
        span.set_resource(resource);
    }
}

fn obfuscate_json_tag(obfuscator: &JsonObfuscator, span: &mut Span, tag: &str) {
    if let Some(value) = span.meta_mut().get_mut(tag) {
        *value = obfuscator.obfuscate(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(type_: &str, resource: &str) -> Span {
        Span::new("svc", "op", resource, type_, 1, 1, 0, 0, 10, 0)
    }

    fn full_config() -> ObfuscationConfig {
        ObfuscationConfig::default()
            .with_http(HttpObfuscationConfig::new(true, true))
            .with_mongo(JsonObfuscationConfig::enabled_with_keep_values(["company"]))
            .with_es(JsonObfuscationConfig::enabled_with_keep_values(Vec::<String>::new()))
    }

    fn meta<'a>(span: &'a Span, key: &str) -> Option<&'a str> {
        span.meta().get(key).map(String::as_str)
    }

    #[test]
    fn sql_resource() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let mut span = span("sql", "SELECT * FROM users WHERE id = 42");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(span.resource(), "SELECT * FROM users WHERE id = ?");
        assert_eq!(meta(&span, tags::SQL_QUERY), Some("SELECT * FROM users WHERE id = ?"));
    }

    #[test]
    fn unparsable_sql_resource() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let mut span = span("cassandra", "SELECT 'unterminated");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(span.resource(), NON_PARSABLE_SQL);
        assert_eq!(meta(&span, tags::SQL_QUERY), Some(NON_PARSABLE_SQL));
    }

    #[test]
    fn sql_disabled() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default().with_sql(SqlObfuscationConfig::new(false)));
        let mut span = span("sql", "SELECT 1");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(span.resource(), "SELECT 1");
        assert!(span.meta().is_empty());
    }

    #[test]
    fn redis_command() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let mut span = span("redis", "redis.command").with_meta(tags::REDIS_RAW_COMMAND, "SET key value\nGET key");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(span.resource(), "SET GET");
        assert_eq!(meta(&span, tags::REDIS_RAW_COMMAND), Some("SET ?\nGET ?"));
    }

    #[test]
    fn redis_resource_without_raw_command() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let mut span = span("redis", "CONFIG SET maxmemory 100");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(span.resource(), "CONFIG SET");
        assert_eq!(meta(&span, tags::REDIS_RAW_COMMAND), Some("CONFIG SET ?"));
    }

    #[test]
    fn http_url() {
        let obfuscator = Obfuscator::new(full_config());
        let mut span = span("web", "GET /users").with_meta(tags::HTTP_URL, "http://u:p@host/users/42?token=abc");
        obfuscator.obfuscate_span(&mut span);

        assert_eq!(meta(&span, tags::HTTP_URL), Some("http://host/users/%3F?"));
    }

    #[test]
    fn json_bodies() {
        let obfuscator = Obfuscator::new(full_config());

        let mut mongo =
            span("mongodb", "find").with_meta(tags::MONGODB_QUERY, r#"{"company":"acme","user":"john"}"#);
        obfuscator.obfuscate_span(&mut mongo);
        assert_eq!(meta(&mongo, tags::MONGODB_QUERY), Some(r#"{"company":"acme","user":"?"}"#));

        let mut es = span("elasticsearch", "search").with_meta(tags::ELASTIC_BODY, r#"{"match":{"name":"x"}}"#);
        obfuscator.obfuscate_span(&mut es);
        assert_eq!(meta(&es, tags::ELASTIC_BODY), Some(r#"{"match":{"name":"?"}}"#));
    }

    #[test]
    fn json_disabled_by_default() {
        let obfuscator = Obfuscator::new(ObfuscationConfig::default());
        let mut mongo = span("mongodb", "find").with_meta(tags::MONGODB_QUERY, r#"{"user":"john"}"#);
        obfuscator.obfuscate_span(&mut mongo);
        assert_eq!(meta(&mongo, tags::MONGODB_QUERY), Some(r#"{"user":"john"}"#));
    }

    #[test]
    fn obfuscation_is_idempotent() {
        let obfuscator = Obfuscator::new(full_config());
        let spans = vec![
            span("sql", "INSERT INTO t (a, b) VALUES (1, 'x'), (2, 'y')"),
            span("sql", "SELECT 'broken"),
            span("redis", "MULTI\nSET a 1\nSET b 2\nSET c 3\nEXEC"),
            span("redis", "redis.command").with_meta(tags::REDIS_RAW_COMMAND, "CLIENT KILL 1.2.3.4"),
            span("http", "GET").with_meta(tags::HTTP_URL, "https://x:y@example.com/a/1/b?q=2"),
            span("http", "GET").with_meta(tags::HTTP_URL, "not a url"),
            span("mongodb", "find").with_meta(tags::MONGODB_QUERY, r#"{"company":"a","n":[1,2]}"#),
            span("custom", "anything 123"),
        ];

        for original in spans {
            let mut once = original.clone();
            obfuscator.obfuscate_span(&mut once);
            let mut twice = once.clone();
            obfuscator.obfuscate_span(&mut twice);
            assert_eq!(once, twice, "original: {}", original);
        }
    }
}
