//! Construction of sanitizers, transforms and matchers from admin requests
//!
//! The admin surface names a variant by identifier and passes its
//! constructor parameters as a JSON object. Each identifier maps to a factory
//! closure that pulls the parameters it understands out of [`Params`];
//! anything left over is rejected.

use std::collections::HashMap;

use fancy_regex::Regex;
use serde_json::{Map, Value};

use crate::matcher::RecordMatcher;
use crate::model::SANITIZE_VALUE;
use crate::pattern::{self, ApplyCondition};
use crate::sanitizer::{EntrySection, JsonPath, Sanitizer, SanitizerKind, EMPTY_SUBSCRIPTION_ID};
use crate::transform::{Transform, TransformKind, DEFAULT_API_VERSION_HEADER};
use crate::{ProxyError, Result};

/// Named constructor parameters with case-insensitive keys
#[derive(Debug)]
pub struct Params {
    identifier: String,
    values: Vec<(String, Value)>,
}

impl Params {
    /// Parse a request body. An empty body means no parameters.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the body is not a JSON object
    pub fn from_body(identifier: &str, body: &[u8]) -> Result<Self> {
        let values = if body.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            let parsed: Value = serde_json::from_slice(body).map_err(|e| {
                ProxyError::BadRequest(format!(
                    "Unable to parse the request body for {identifier} as json: {e}"
                ))
            })?;
            match parsed {
                Value::Object(map) => map.into_iter().collect(),
                Value::Null => Vec::new(),
                _ => {
                    return Err(ProxyError::BadRequest(format!(
                        "The request body for {identifier} must be a json object."
                    )))
                }
            }
        };

        Ok(Self {
            identifier: identifier.to_string(),
            values,
        })
    }

    fn take(&mut self, name: &str) -> Option<Value> {
        let index = self
            .values
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        match self.values.remove(index).1 {
            Value::Null => None,
            value => Some(value),
        }
    }

    fn wrong_type(&self, name: &str, expected: &str) -> ProxyError {
        ProxyError::BadRequest(format!(
            "Parameter \"{name}\" for {} must be {expected}.",
            self.identifier
        ))
    }

    /// A string parameter that must be present
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` naming the missing key
    pub fn required_str(&mut self, name: &str) -> Result<String> {
        self.optional_str(name)?.ok_or_else(|| {
            ProxyError::BadRequest(format!(
                "Required parameter key \"{name}\" was not found in the request body for {}.",
                self.identifier
            ))
        })
    }

    /// A string parameter that may be absent
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the value is not a string
    pub fn optional_str(&mut self, name: &str) -> Result<Option<String>> {
        match self.take(name) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(self.wrong_type(name, "a string")),
        }
    }

    /// A boolean parameter, also accepting `"true"`/`"false"` strings
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the value is not a boolean
    pub fn optional_bool(&mut self, name: &str) -> Result<Option<bool>> {
        match self.take(name) {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(value)),
            Some(Value::String(value)) => match value.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(self.wrong_type(name, "a boolean")),
            },
            Some(_) => Err(self.wrong_type(name, "a boolean")),
        }
    }

    /// A list given either as a comma separated string or a string array
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for any other shape
    pub fn optional_list(&mut self, name: &str) -> Result<Vec<String>> {
        match self.take(name) {
            None => Ok(Vec::new()),
            Some(Value::String(value)) => Ok(split_list(&value)),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    _ => Err(self.wrong_type(name, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(self.wrong_type(name, "a comma separated string")),
        }
    }

    /// An optional regex parameter, compiled
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the pattern does not compile
    pub fn optional_regex(&mut self, name: &str) -> Result<Option<Regex>> {
        self.optional_str(name)?
            .map(|pattern| pattern::compile(&pattern))
            .transpose()
    }

    /// A required regex parameter, compiled
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if missing or invalid
    pub fn required_regex(&mut self, name: &str) -> Result<Regex> {
        let pattern = self.required_str(name)?;
        pattern::compile(&pattern)
    }

    /// The `condition` parameter, `{"uriRegex": "..."}`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` if the condition has no usable regex
    pub fn condition(&mut self) -> Result<Option<ApplyCondition>> {
        let Some(value) = self.take("condition") else {
            return Ok(None);
        };
        let Value::Object(map) = value else {
            return Err(self.wrong_type("condition", "an object"));
        };
        let uri_regex = uri_regex_of(&map).unwrap_or_default();
        ApplyCondition::new(&uri_regex).map(Some)
    }

    /// Reject any parameter nobody consumed
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` naming the extra key
    pub fn finish(self) -> Result<()> {
        match self.values.first() {
            None => Ok(()),
            Some((key, _)) => Err(ProxyError::BadRequest(format!(
                "Parameter \"{key}\" is an extra key that {} does not accept.",
                self.identifier
            ))),
        }
    }
}

fn uri_regex_of(map: &Map<String, Value>) -> Option<String> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("uriRegex"))
        .and_then(|(_, value)| value.as_str())
        .map(str::to_string)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

type SanitizerFactory = Box<dyn Fn(&mut Params) -> Result<Sanitizer> + Send + Sync>;
type TransformFactory = Box<dyn Fn(&mut Params) -> Result<Transform> + Send + Sync>;
type MatcherFactory = Box<dyn Fn(&mut Params) -> Result<RecordMatcher> + Send + Sync>;

/// Identifier to factory tables for every admin-constructible variant
pub struct Registry {
    sanitizers: HashMap<String, SanitizerFactory>,
    transforms: HashMap<String, TransformFactory>,
    matchers: HashMap<String, MatcherFactory>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("sanitizers", &self.sanitizers.len())
            .field("transforms", &self.transforms.len())
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

impl Registry {
    /// An empty registry
    #[must_use]
    pub fn empty() -> Self {
        Self {
            sanitizers: HashMap::new(),
            transforms: HashMap::new(),
            matchers: HashMap::new(),
        }
    }

    /// Register a sanitizer factory under `identifier`
    pub fn register_sanitizer(
        &mut self,
        identifier: &str,
        factory: impl Fn(&mut Params) -> Result<Sanitizer> + Send + Sync + 'static,
    ) {
        self.sanitizers
            .insert(identifier.to_ascii_lowercase(), Box::new(factory));
    }

    /// Register a transform factory under `identifier`
    pub fn register_transform(
        &mut self,
        identifier: &str,
        factory: impl Fn(&mut Params) -> Result<Transform> + Send + Sync + 'static,
    ) {
        self.transforms
            .insert(identifier.to_ascii_lowercase(), Box::new(factory));
    }

    /// Register a matcher factory under `identifier`
    pub fn register_matcher(
        &mut self,
        identifier: &str,
        factory: impl Fn(&mut Params) -> Result<RecordMatcher> + Send + Sync + 'static,
    ) {
        self.matchers
            .insert(identifier.to_ascii_lowercase(), Box::new(factory));
    }

    /// Build a sanitizer from its identifier and JSON parameters
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for unknown identifiers or bad parameters
    pub fn build_sanitizer(&self, identifier: &str, body: &[u8]) -> Result<Sanitizer> {
        let factory = self
            .sanitizers
            .get(&identifier.to_ascii_lowercase())
            .ok_or_else(|| unknown(identifier, "sanitizer"))?;
        build(identifier, body, factory)
    }

    /// Build a transform from its identifier and JSON parameters
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for unknown identifiers or bad parameters
    pub fn build_transform(&self, identifier: &str, body: &[u8]) -> Result<Transform> {
        let factory = self
            .transforms
            .get(&identifier.to_ascii_lowercase())
            .ok_or_else(|| unknown(identifier, "transform"))?;
        build(identifier, body, factory)
    }

    /// Build a matcher from its identifier and JSON parameters
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::BadRequest` for unknown identifiers or bad parameters
    pub fn build_matcher(&self, identifier: &str, body: &[u8]) -> Result<RecordMatcher> {
        let factory = self
            .matchers
            .get(&identifier.to_ascii_lowercase())
            .ok_or_else(|| unknown(identifier, "matcher"))?;
        build(identifier, body, factory)
    }

    /// Registry populated with every built-in variant
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_builtin_sanitizers();
        registry.register_builtin_transforms();
        registry.register_builtin_matchers();
        registry
    }

    fn register_builtin_sanitizers(&mut self) {
        self.register_sanitizer("HeaderRegexSanitizer", |p| {
            let kind = SanitizerKind::HeaderRegex {
                key: p.required_str("key")?,
                value: value_param(p)?,
                regex: p.optional_regex("regex")?,
                group: p.optional_str("groupForReplace")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("BodyRegexSanitizer", |p| {
            let kind = SanitizerKind::BodyRegex {
                value: value_param(p)?,
                regex: p.optional_regex("regex")?,
                group: p.optional_str("groupForReplace")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("BodyKeySanitizer", |p| {
            let kind = SanitizerKind::BodyKey {
                json_path: JsonPath::parse(&p.required_str("jsonPath")?)?,
                value: value_param(p)?,
                regex: p.optional_regex("regex")?,
                group: p.optional_str("groupForReplace")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("UriRegexSanitizer", |p| {
            let kind = SanitizerKind::UriRegex {
                value: value_param(p)?,
                regex: p.required_regex("regex")?,
                group: p.optional_str("groupForReplace")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("UriSubscriptionIdSanitizer", |p| {
            let kind = SanitizerKind::UriSubscriptionId {
                value: p
                    .optional_str("value")?
                    .unwrap_or_else(|| EMPTY_SUBSCRIPTION_ID.to_string()),
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("GeneralRegexSanitizer", |p| {
            let kind = SanitizerKind::GeneralRegex {
                value: value_param(p)?,
                regex: p.required_regex("regex")?,
                group: p.optional_str("groupForReplace")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("RemoveHeaderSanitizer", |p| {
            let headers = split_list(&p.required_str("headersForRemoval")?);
            Ok(Sanitizer::new(
                SanitizerKind::RemoveHeader { headers },
                p.condition()?,
            ))
        });
        self.register_sanitizer("ContentDispositionFilePathSanitizer", |p| {
            Ok(Sanitizer::new(
                SanitizerKind::ContentDispositionFilePath,
                p.condition()?,
            ))
        });
        self.register_sanitizer("OAuthResponseSanitizer", |p| {
            Ok(Sanitizer::new(SanitizerKind::OAuthResponse, p.condition()?))
        });
        self.register_sanitizer("RegexEntrySanitizer", |p| {
            let kind = SanitizerKind::RegexEntry {
                target: EntrySection::parse(&p.required_str("target")?)?,
                regex: p.required_regex("regex")?,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("ContinuationSanitizer", |p| {
            let kind = SanitizerKind::Continuation {
                key: p.required_str("key")?,
                method: p
                    .optional_str("method")?
                    .unwrap_or_else(|| "guid".to_string()),
                reset_after_first: p.optional_bool("resetAfterFirst")?.unwrap_or(false),
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("HeaderStringSanitizer", |p| {
            let kind = SanitizerKind::HeaderRegex {
                key: p.required_str("key")?,
                regex: Some(pattern::literal(&p.required_str("target")?)?),
                value: value_param(p)?,
                group: None,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("BodyStringSanitizer", |p| {
            let kind = SanitizerKind::BodyRegex {
                regex: Some(pattern::literal(&p.required_str("target")?)?),
                value: value_param(p)?,
                group: None,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("UriStringSanitizer", |p| {
            let kind = SanitizerKind::UriRegex {
                regex: pattern::literal(&p.required_str("target")?)?,
                value: value_param(p)?,
                group: None,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
        self.register_sanitizer("GeneralStringSanitizer", |p| {
            let kind = SanitizerKind::GeneralRegex {
                regex: pattern::literal(&p.required_str("target")?)?,
                value: value_param(p)?,
                group: None,
            };
            Ok(Sanitizer::new(kind, p.condition()?))
        });
    }

    fn register_builtin_transforms(&mut self) {
        self.register_transform("ApiVersionTransform", |p| {
            let header = p
                .optional_str("headerName")?
                .unwrap_or_else(|| DEFAULT_API_VERSION_HEADER.to_string());
            Ok(Transform::new(TransformKind::ApiVersion { header }, p.condition()?))
        });
        self.register_transform("StorageRequestIdTransform", |p| {
            Ok(Transform::new(TransformKind::StorageRequestId, p.condition()?))
        });
        self.register_transform("ClientIdTransform", |p| {
            Ok(Transform::new(TransformKind::ClientId, p.condition()?))
        });
        self.register_transform("HeaderTransform", |p| {
            let kind = TransformKind::Header {
                key: p.required_str("key")?,
                value: p.required_str("value")?,
            };
            Ok(Transform::new(kind, p.condition()?))
        });
        self.register_transform("RetryAfterZeroTransform", |p| {
            Ok(Transform::new(TransformKind::RetryAfterZero, p.condition()?))
        });
        self.register_transform("UrlHostTransform", |p| {
            Ok(Transform::new(TransformKind::UrlHost, p.condition()?))
        });
    }

    fn register_builtin_matchers(&mut self) {
        self.register_matcher("BodilessMatcher", |_| Ok(RecordMatcher::bodiless()));
        self.register_matcher("HeaderlessMatcher", |_| Ok(RecordMatcher::headerless()));
        self.register_matcher("CustomDefaultMatcher", |p| {
            let compare_bodies = p.optional_bool("compareBodies")?.unwrap_or(true);
            let excluded = p.optional_list("excludedHeaders")?;
            let ignored = p.optional_list("ignoredHeaders")?;
            let ignore_query_ordering = p.optional_bool("ignoreQueryOrdering")?.unwrap_or(false);
            let ignored_query = p.optional_list("ignoredQueryParameters")?;
            Ok(RecordMatcher::custom(
                compare_bodies,
                &excluded,
                &ignored,
                ignore_query_ordering,
                &ignored_query,
            ))
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn value_param(params: &mut Params) -> Result<String> {
    Ok(params
        .optional_str("value")?
        .unwrap_or_else(|| SANITIZE_VALUE.to_string()))
}

fn unknown(identifier: &str, what: &str) -> ProxyError {
    ProxyError::BadRequest(format!(
        "Requested type {identifier} is not a recognized {what}."
    ))
}

fn build<T>(
    identifier: &str,
    body: &[u8],
    factory: &(dyn Fn(&mut Params) -> Result<T> + Send + Sync),
) -> Result<T> {
    let mut params = Params::from_body(identifier, body)?;
    let built = factory(&mut params)?;
    params.finish()?;
    Ok(built)
}
