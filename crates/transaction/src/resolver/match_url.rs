//! Match URL parsing.
//!
//! A match URL is a search expression of the form `Type?param=value&...`.
//! Only single-predicate expressions on registered token parameters are eligible
//! for bulk resolution; everything else takes the per-entry path.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::TokenHash;
use crate::error::ValidationError;
use crate::index::SearchHasher;
use crate::types::PartitionId;

static SINGLE_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^?]+[?][a-z0-9-]+=[^&,]+$").expect("single-predicate pattern is valid")
});

const ANY_TYPE: &str = "*";

/// Token search parameters known per resource type.
#[derive(Debug, Clone)]
pub struct SearchParamRegistry {
    tokens: HashMap<String, HashSet<String>>,
}

impl Default for SearchParamRegistry {
    fn default() -> Self {
        Self::new().with_token_param(ANY_TYPE, "identifier")
    }
}

impl SearchParamRegistry {
    /// Creates a registry with no parameters.
    pub fn new() -> Self {
        Self {
            tokens: HashMap::new(),
        }
    }

    /// Registers a token parameter for a resource type, or for every type with `*`.
    pub fn with_token_param(
        mut self,
        resource_type: impl Into<String>,
        param_name: impl Into<String>,
    ) -> Self {
        self.tokens
            .entry(resource_type.into())
            .or_default()
            .insert(param_name.into());
        self
    }

    /// Returns true if `param_name` is a token parameter of `resource_type`.
    pub fn is_token(&self, resource_type: &str, param_name: &str) -> bool {
        [resource_type, ANY_TYPE].iter().any(|t| {
            self.tokens
                .get(*t)
                .is_some_and(|params| params.contains(param_name))
        })
    }
}

/// A token search value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenValue {
    /// `None` for a bare `value`, `Some("")` for `|value`.
    pub system: Option<String>,
    /// The code or identifier value.
    pub value: String,
}

impl TokenValue {
    /// Parses `system|value`, `|value` or `value`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('|') {
            Some((system, value)) => Self {
                system: Some(system.to_string()),
                value: value.to_string(),
            },
            None => Self {
                system: None,
                value: raw.to_string(),
            },
        }
    }

    /// The hash an index row must carry to satisfy this value.
    ///
    /// A bare value matches any system; `|value` matches only rows without one.
    pub fn hash(
        &self,
        hasher: &SearchHasher,
        partition: Option<PartitionId>,
        resource_type: &str,
        param_name: &str,
    ) -> TokenHash {
        match &self.system {
            Some(system) => TokenHash::SystemAndValue(hasher.hash_system_and_value(
                partition,
                resource_type,
                param_name,
                system,
                &self.value,
            )),
            None => TokenHash::Value(hasher.hash_value(
                partition,
                resource_type,
                param_name,
                &self.value,
            )),
        }
    }
}

/// One `param=value` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPredicate {
    /// Parameter name, without modifiers.
    pub param_name: String,
    /// Decoded raw value.
    pub value: String,
}

/// A parsed match URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMatchUrl {
    /// Resource type before `?`.
    pub resource_type: String,
    /// Predicates in expression order.
    pub predicates: Vec<MatchPredicate>,
}

impl ParsedMatchUrl {
    /// Parses a match URL; the expression must name a type and at least one predicate.
    pub fn parse(match_url: &str) -> Result<Self, ValidationError> {
        let invalid = |message: &str| ValidationError::InvalidMatchUrl {
            match_url: match_url.to_string(),
            message: message.to_string(),
        };

        let (resource_type, query) = match_url
            .split_once('?')
            .ok_or_else(|| invalid("missing '?'"))?;
        let resource_type = resource_type.rsplit('/').next().unwrap_or(resource_type);
        if resource_type.is_empty() {
            return Err(invalid("missing resource type"));
        }

        let predicates: Vec<MatchPredicate> = url::form_urlencoded::parse(query.as_bytes())
            .map(|(name, value)| MatchPredicate {
                param_name: name.into_owned(),
                value: value.into_owned(),
            })
            .collect();
        if predicates.is_empty() {
            return Err(invalid("no search parameters"));
        }
        if let Some(empty) = predicates.iter().find(|p| p.param_name.is_empty()) {
            return Err(invalid(&format!("empty parameter name for value '{}'", empty.value)));
        }

        Ok(Self {
            resource_type: resource_type.to_string(),
            predicates,
        })
    }
}

/// A match URL eligible for bulk resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleTokenMatch {
    /// Resource type the expression targets.
    pub resource_type: String,
    /// The token parameter.
    pub param_name: String,
    /// The token value.
    pub token: TokenValue,
}

/// Classifies match URLs against a parameter registry.
#[derive(Debug, Clone, Default)]
pub struct MatchUrlParser {
    registry: SearchParamRegistry,
}

impl MatchUrlParser {
    /// Creates a parser over a registry.
    pub fn new(registry: SearchParamRegistry) -> Self {
        Self { registry }
    }

    /// The parameter registry.
    pub fn registry(&self) -> &SearchParamRegistry {
        &self.registry
    }

    /// Returns the single token predicate of `match_url`, or `None` when the
    /// expression has several predicates, modifiers, a non-token parameter or
    /// a blank code.
    pub fn single_token(&self, match_url: &str) -> Option<SingleTokenMatch> {
        if !SINGLE_PREDICATE.is_match(match_url) {
            return None;
        }
        let parsed = ParsedMatchUrl::parse(match_url).ok()?;
        let [predicate] = parsed.predicates.as_slice() else {
            return None;
        };
        if !self.registry.is_token(&parsed.resource_type, &predicate.param_name) {
            return None;
        }
        let token = TokenValue::parse(&predicate.value);
        if token.value.trim().is_empty() {
            return None;
        }
        Some(SingleTokenMatch {
            param_name: predicate.param_name.clone(),
            token,
            resource_type: parsed.resource_type,
        })
    }

    /// Parses every predicate, requiring each to be a token parameter.
    ///
    /// Used by the per-entry path, which intersects one lookup per predicate.
    pub fn token_predicates(&self, match_url: &str) -> Result<(String, Vec<(String, TokenValue)>), ValidationError> {
        let parsed = ParsedMatchUrl::parse(match_url)?;
        let mut tokens = Vec::with_capacity(parsed.predicates.len());
        for predicate in parsed.predicates {
            if !self.registry.is_token(&parsed.resource_type, &predicate.param_name) {
                return Err(ValidationError::InvalidMatchUrl {
                    match_url: match_url.to_string(),
                    message: format!(
                        "unsupported search parameter '{}' for {}",
                        predicate.param_name, parsed.resource_type
                    ),
                });
            }
            tokens.push((predicate.param_name, TokenValue::parse(&predicate.value)));
        }
        Ok((parsed.resource_type, tokens))
    }
}
