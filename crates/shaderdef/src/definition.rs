use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::annotations::{parse_iterations, parse_parameters, ShaderParameter};
use crate::ShaderId;

/// One entry of a shader's revision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub at: DateTime<Utc>,
    pub note: String,
}

/// A shader as produced by the evolution pipeline.
///
/// Fields are read-only; the only mutation is [`ShaderDefinition::update_source`],
/// which keeps the parsed parameters in sync with the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderDefinition {
    id: ShaderId,
    name: String,
    cache_key: String,
    source: String,
    parameters: Vec<ShaderParameter>,
    iterations: Option<u32>,
    description: Option<String>,
    changelog: Vec<ChangelogEntry>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl ShaderDefinition {
    /// Builds a definition whose cache key defaults to the id.
    pub fn new(id: impl Into<ShaderId>, name: impl Into<String>, source: impl Into<String>) -> Self {
        let id = id.into();
        let source = source.into();
        let now = Utc::now();
        Self {
            cache_key: id.0.clone(),
            id,
            name: name.into(),
            parameters: parse_parameters(&source),
            source,
            iterations: None,
            description: None,
            changelog: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = cache_key.into();
        self
    }

    /// Stores an explicit per-shader iteration count that outranks `@iterations`.
    pub fn with_iterations(mut self, iterations: Option<u32>) -> Self {
        self.iterations = iterations.filter(|count| *count > 0);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn id(&self) -> &ShaderId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parameters(&self) -> &[ShaderParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ShaderParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Stored iteration count (not the `@iterations` annotation).
    pub fn iterations(&self) -> Option<u32> {
        self.iterations
    }

    /// Iteration count declared by the shader text itself.
    pub fn declared_iterations(&self) -> Option<u32> {
        parse_iterations(&self.source)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn changelog(&self) -> &[ChangelogEntry] {
        &self.changelog
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Default value of every declared parameter, keyed by name.
    pub fn default_values(&self) -> BTreeMap<String, f32> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default))
            .collect()
    }

    /// Replaces the source text and re-derives the declared parameters.
    pub fn update_source(&mut self, source: impl Into<String>, note: impl Into<String>) {
        let source = source.into();
        let now = Utc::now();
        self.parameters = parse_parameters(&source);
        self.source = source;
        self.changelog.push(ChangelogEntry {
            at: now,
            note: note.into(),
        });
        self.modified_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
// @param scale: 1.0, 8.0, 2.0
// @iterations: 4
@compute @workgroup_size(8, 8, 1)
fn main() {}
"#;

    #[test]
    fn derives_parameters_on_creation() {
        let shader = ShaderDefinition::new("s1", "Swirl", SOURCE);
        assert_eq!(shader.cache_key(), "s1");
        assert_eq!(shader.parameters().len(), 1);
        assert_eq!(shader.declared_iterations(), Some(4));
        assert_eq!(shader.iterations(), None);
        assert_eq!(shader.default_values().get("scale"), Some(&2.0));
    }

    #[test]
    fn update_source_rederives_parameters() {
        let mut shader = ShaderDefinition::new("s1", "Swirl", SOURCE);
        let created = shader.modified_at();
        shader.update_source(
            "// @param a: 0, 1, 0.5\n// @param b: 0, 2, 1\nfn main() {}",
            "split scale into two knobs",
        );
        let names: Vec<_> = shader.parameters().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(shader.declared_iterations(), None);
        assert_eq!(shader.changelog().len(), 1);
        assert!(shader.modified_at() >= created);
        assert_eq!(shader.created_at(), created);
    }

    #[test]
    fn zero_stored_iterations_are_dropped() {
        let shader = ShaderDefinition::new("s1", "Swirl", SOURCE).with_iterations(Some(0));
        assert_eq!(shader.iterations(), None);
    }
}
