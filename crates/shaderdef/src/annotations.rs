//! Declarative shader annotations.
//!
//! Shader text may carry comment lines such as
//!
//! ```text
//! // @param frequency: 0.0, 10.0, 2.0, 0.1
//! // @iterations: 8
//! ```
//!
//! `parse_parameters` returns the `@param` declarations in source order and
//! `parse_iterations` the optional `@iterations` count. Both tolerate sloppy
//! formatting because most shader text arrives from a language model; a
//! declaration that cannot be honoured is skipped with a warning rather than
//! failing the whole shader.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PARAM_TAG: &str = "@param";
const ITERATIONS_TAG: &str = "@iterations";

#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("parameter name must not be empty")]
    EmptyName,
    #[error("parameter '{name}' has non-finite bounds")]
    NonFinite { name: String },
    #[error("parameter '{name}' violates min <= default <= max ({min} <= {default} <= {max})")]
    OutOfOrder {
        name: String,
        min: f32,
        max: f32,
        default: f32,
    },
    #[error("parameter '{name}' step must be positive (got {step})")]
    InvalidStep { name: String, step: f32 },
    #[error("malformed parameter annotation: {0}")]
    Malformed(String),
}

/// A tunable float exposed by a shader through a `@param` annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderParameter {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub step: f32,
}

impl ShaderParameter {
    pub fn new(
        name: impl Into<String>,
        min: f32,
        max: f32,
        default: f32,
        step: f32,
    ) -> Result<Self, ParameterError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ParameterError::EmptyName);
        }
        if !(min.is_finite() && max.is_finite() && default.is_finite() && step.is_finite()) {
            return Err(ParameterError::NonFinite { name });
        }
        if !(min <= default && default <= max) {
            return Err(ParameterError::OutOfOrder {
                name,
                min,
                max,
                default,
            });
        }
        if step <= 0.0 {
            return Err(ParameterError::InvalidStep { name, step });
        }
        Ok(Self {
            name,
            min,
            max,
            default,
            step,
        })
    }

    /// Clamps `value` into `[min, max]`; NaN collapses to the default.
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            self.default
        } else {
            value.clamp(self.min, self.max)
        }
    }
}

/// Parses every `@param` annotation in declaration order.
pub fn parse_parameters(source: &str) -> Vec<ShaderParameter> {
    let mut parameters: Vec<ShaderParameter> = Vec::new();
    for (index, line) in source.lines().enumerate() {
        let Some(body) = annotation_body(line, PARAM_TAG) else {
            continue;
        };
        match parse_param_body(body) {
            Ok(parameter) => {
                if parameters.iter().any(|p| p.name == parameter.name) {
                    tracing::warn!(
                        line = index + 1,
                        name = %parameter.name,
                        "duplicate @param annotation ignored"
                    );
                    continue;
                }
                parameters.push(parameter);
            }
            Err(error) => {
                tracing::warn!(line = index + 1, %error, "skipping invalid @param annotation");
            }
        }
    }
    parameters
}

/// Returns the declared `@iterations` count, if any. Zero counts as absent.
pub fn parse_iterations(source: &str) -> Option<u32> {
    for line in source.lines() {
        let Some(body) = annotation_body(line, ITERATIONS_TAG) else {
            continue;
        };
        let raw = body.trim_start_matches(':').trim();
        match raw.parse::<u32>() {
            Ok(0) => return None,
            Ok(count) => return Some(count),
            Err(_) => {
                tracing::warn!(value = raw, "ignoring malformed @iterations annotation");
            }
        }
    }
    None
}

/// Strips comment markers and the tag, returning the text after the tag.
fn annotation_body<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let mut trimmed = line.trim_start();
    for marker in ["///", "//", "/*", "*"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            trimmed = rest.trim_start();
            break;
        }
    }
    let rest = trimmed.strip_prefix(tag)?;
    // `@parameters` or `@iterationsX` must not match.
    match rest.chars().next() {
        Some(ch) if ch.is_whitespace() || ch == ':' => {}
        _ => return None,
    }
    Some(rest.trim().trim_end_matches("*/").trim())
}

fn parse_param_body(body: &str) -> Result<ShaderParameter, ParameterError> {
    let (name, values) = body
        .split_once(':')
        .ok_or_else(|| ParameterError::Malformed(body.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ParameterError::EmptyName);
    }
    if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(ParameterError::Malformed(format!(
            "invalid parameter name '{name}'"
        )));
    }

    let numbers = values
        .split(',')
        .map(|part| part.trim().trim_end_matches(';').trim())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f32>()
                .map_err(|_| ParameterError::Malformed(format!("'{part}' is not a number")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (min, max, default, step) = match numbers.as_slice() {
        [min, max, default] => (*min, *max, *default, default_step(*min, *max)),
        [min, max, default, step] => (*min, *max, *default, *step),
        _ => {
            return Err(ParameterError::Malformed(format!(
                "'{name}' expects 3 or 4 values, found {}",
                numbers.len()
            )))
        }
    };
    ShaderParameter::new(name, min, max, default, step)
}

fn default_step(min: f32, max: f32) -> f32 {
    let span = (max - min) / 100.0;
    if span > 0.0 && span.is_finite() {
        span
    } else {
        0.01
    }
}
