//! Trace filters: the resource blacklist and tag replacement.

use basenji_core::Trace;
use basenji_error::{generic_error, GenericError};
use regex::Regex;
use serde::Deserialize;
use tracing::error;

/// Tag replacement target for the resource name.
const RESOURCE_TARGET: &str = "resource.name";

/// Tag replacement target for the resource name and every tag value.
const ALL_TARGET: &str = "*";

/// Drops traces whose root resource matches any of a list of patterns.
#[derive(Clone, Debug, Default)]
pub struct ResourceFilter {
    blacklist: Vec<Regex>,
}

impl ResourceFilter {
    /// Creates a new `ResourceFilter` from the given patterns.
    ///
    /// Patterns that fail to compile are logged and ignored, so a typo in one entry does not turn the whole blacklist
    /// off.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let blacklist = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern.as_ref()) {
                Ok(re) => Some(re),
                Err(e) => {
                    error!(pattern = pattern.as_ref(), error = %e, "Invalid resource filter. Ignoring.");
                    None
                }
            })
            .collect();
        Self { blacklist }
    }

    /// Returns `true` if a trace whose root carries `resource` should be kept.
    pub fn keep(&self, resource: &str) -> bool {
        !self.blacklist.iter().any(|re| re.is_match(resource))
    }

    /// Returns the number of active patterns.
    pub fn len(&self) -> usize {
        self.blacklist.len()
    }

    /// Returns `true` if no pattern is active.
    pub fn is_empty(&self) -> bool {
        self.blacklist.is_empty()
    }
}

/// A tag replacement rule, as configured.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ReplaceRuleConfig {
    /// Tag the rule applies to: a tag key, `resource.name`, or `*` for the resource and every tag.
    pub name: String,

    /// Pattern to search for.
    pub pattern: String,

    /// Replacement, which may reference capture groups as `${1}`.
    pub repl: String,
}

#[derive(Clone, Debug)]
struct ReplaceRule {
    name: String,
    re: Regex,
    repl: String,
}

/// Rewrites tag values and resources of every span in a trace.
#[derive(Clone, Debug, Default)]
pub struct TagReplacer {
    rules: Vec<ReplaceRule>,
}

impl TagReplacer {
    /// Creates a new `TagReplacer` from the given rules.
    ///
    /// # Errors
    ///
    /// If any rule has an empty name or a pattern that fails to compile, an error is returned.
    pub fn new(rules: &[ReplaceRuleConfig]) -> Result<Self, GenericError> {
        let rules = rules
            .iter()
            .map(|rule| {
                if rule.name.is_empty() {
                    return Err(generic_error!("replace_tags: rule for pattern '{}' has no name", rule.pattern));
                }
                let re = Regex::new(&rule.pattern)
                    .map_err(|e| generic_error!("replace_tags: invalid pattern '{}': {}", rule.pattern, e))?;
                Ok(ReplaceRule {
                    name: rule.name.clone(),
                    re,
                    repl: rule.repl.clone(),
                })
            })
            .collect::<Result<Vec<_>, GenericError>>()?;
        Ok(Self { rules })
    }

    /// Returns `true` if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule, in order, to every span of `trace`.
    pub fn replace(&self, trace: &mut Trace) {
        for rule in &self.rules {
            for span in trace.spans_mut() {
                match rule.name.as_str() {
                    ALL_TARGET => {
                        for value in span.meta_mut().values_mut() {
                            replace_in_place(value, &rule.re, &rule.repl);
                        }
                        let mut resource = span.resource().to_string();
                        if replace_in_place(&mut resource, &rule.re, &rule.repl) {
                            span.set_resource(resource);
                        }
                    }
                    RESOURCE_TARGET => {
                        let mut resource = span.resource().to_string();
                        if replace_in_place(&mut resource, &rule.re, &rule.repl) {
                            span.set_resource(resource);
                        }
                    }
                    key => {
                        if let Some(value) = span.meta_mut().get_mut(key) {
                            replace_in_place(value, &rule.re, &rule.repl);
                        }
                    }
                }
            }
        }
    }
}

fn replace_in_place(value: &mut String, re: &Regex, repl: &str) -> bool {
    let replaced = re.replace_all(value, repl);
    if replaced == value.as_str() {
        return false;
    }
    *value = replaced.into_owned();
    true
}
