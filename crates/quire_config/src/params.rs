//! Typed view over one document entry of a directory config file.
//!
//! Entries are free-form JSON objects. A handful of keys steer graph
//! resolution; everything else is a declared argument that filters may read
//! and that takes part in fingerprinting when it is keyed by a filter alias.

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// One element of an entry's `inputs` list.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDirective {
    /// Pattern (with optional `|filter` aliases) naming the input documents.
    pub pattern: String,
    /// Parameters for a nested declaration (`{"pattern": {...}}`), if any.
    pub params: Option<Map<String, Value>>,
}

/// Parameters of a single document entry after `$globals` have been merged in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocParams {
    /// Literal source contents for a virtual document.
    pub contents: Option<String>,
    /// Remote source for a virtual document.
    pub url: Option<String>,
    /// Explicit input declarations.
    pub inputs: Vec<InputDirective>,
    /// Create only if one of these patterns matches a document.
    pub ifinput: Vec<String>,
    /// Create only if this pattern matches no document.
    pub ifnoinput: Option<String>,
    /// Regex; matching file paths are skipped.
    pub except: Option<String>,
    /// Skip the entry entirely.
    pub disabled: bool,
    /// Depend on every document that does not itself use `allinputs`.
    pub allinputs: bool,
    /// Filter aliases appended after those named in the pattern.
    pub filters: Vec<String>,
    /// The complete merged entry, steering keys included.
    pub args: Map<String, Value>,
}

impl DocParams {
    /// Builds parameters for `pattern` from its raw JSON entry, merging
    /// `globals` underneath. Keys present in both keep the entry's value,
    /// except that two objects under the same key are merged one level deep.
    pub fn from_entry(
        pattern: &str,
        entry: &Value,
        globals: &Map<String, Value>,
    ) -> Result<Self, ConfigError> {
        let local = match entry {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(invalid(
                    pattern,
                    format!("expected an object, found {}", type_name(other)),
                ))
            }
        };
        Self::from_map(pattern, merge_globals(local, globals))
    }

    /// Builds parameters from an already merged argument map.
    pub fn from_map(pattern: &str, args: Map<String, Value>) -> Result<Self, ConfigError> {
        let mut params = DocParams {
            contents: optional_string(pattern, &args, "contents")?,
            url: optional_string(pattern, &args, "url")?,
            ifnoinput: optional_string(pattern, &args, "ifnoinput")?,
            except: optional_string(pattern, &args, "except")?,
            ..Default::default()
        };

        if let Some(inputs) = args.get("inputs") {
            params.inputs = parse_inputs(pattern, inputs)?;
        }
        if let Some(ifinput) = args.get("ifinput") {
            params.ifinput = string_or_list(pattern, "ifinput", ifinput)?;
        }
        if let Some(filters) = args.get("filters") {
            params.filters = string_or_list(pattern, "filters", filters)?;
        }
        params.disabled = match args.get("disabled") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(invalid(
                    pattern,
                    format!("disabled should be a boolean, found {}", type_name(other)),
                ))
            }
        };
        // Presence is what counts; only an explicit false turns it off.
        params.allinputs = !matches!(
            args.get("allinputs"),
            None | Some(Value::Null) | Some(Value::Bool(false))
        );

        params.args = args;
        Ok(params)
    }

    /// Returns `true` when the entry declares no arguments at all. A blank
    /// entry never replaces the arguments of an existing document.
    pub fn is_blank(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns the argument block keyed by a filter alias, if declared.
    pub fn filter_args(&self, alias: &str) -> Option<&Value> {
        self.args.get(alias)
    }
}

fn merge_globals(local: Map<String, Value>, globals: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = globals.clone();
    for (key, value) in local {
        match value {
            Value::Object(nested) if matches!(merged.get(&key), Some(Value::Object(_))) => {
                if let Some(Value::Object(global)) = merged.get_mut(&key) {
                    global.extend(nested);
                }
            }
            value => {
                merged.insert(key, value);
            }
        }
    }
    merged
}

fn parse_inputs(pattern: &str, value: &Value) -> Result<Vec<InputDirective>, ConfigError> {
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => {
            return Err(invalid(
                pattern,
                format!("inputs should be an array, not a string: {s}"),
            ))
        }
        other => {
            return Err(invalid(
                pattern,
                format!("inputs should be an array, found {}", type_name(other)),
            ))
        }
    };

    let mut directives = Vec::new();
    for item in items {
        match item {
            Value::String(s) => directives.push(InputDirective {
                pattern: s.clone(),
                params: None,
            }),
            Value::Object(nested) => {
                for (inner_pattern, inner) in nested {
                    let params = match inner {
                        Value::Object(map) => map.clone(),
                        Value::Null => Map::new(),
                        other => {
                            return Err(invalid(
                                pattern,
                                format!(
                                    "input '{inner_pattern}' should map to an object, found {}",
                                    type_name(other)
                                ),
                            ))
                        }
                    };
                    directives.push(InputDirective {
                        pattern: inner_pattern.clone(),
                        params: Some(params),
                    });
                }
            }
            other => {
                return Err(invalid(
                    pattern,
                    format!("unexpected {} in inputs", type_name(other)),
                ))
            }
        }
    }
    Ok(directives)
}

fn string_or_list(pattern: &str, key: &str, value: &Value) -> Result<Vec<String>, ConfigError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(invalid(
                    pattern,
                    format!("{key} should contain strings, found {}", type_name(other)),
                )),
            })
            .collect(),
        other => Err(invalid(
            pattern,
            format!("{key} should be a string or a list, found {}", type_name(other)),
        )),
    }
}

fn optional_string(
    pattern: &str,
    args: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, ConfigError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(invalid(
            pattern,
            format!("{key} should be a string, found {}", type_name(other)),
        )),
    }
}

fn invalid(pattern: &str, reason: String) -> ConfigError {
    ConfigError::InvalidEntry {
        pattern: pattern.to_string(),
        reason,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
