use std::collections::BTreeMap;

use thiserror::Error;

use crate::{ShaderDefinition, ShaderId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LibraryError {
    #[error("shader '{0}' not found")]
    UnknownShader(ShaderId),
    #[error("cache key '{key}' already belongs to shader '{holder}' with different source")]
    CacheKeyConflict { key: String, holder: ShaderId },
}

/// In-memory set of live shader definitions keyed by id.
///
/// Cache keys must map to exactly one source text: a second shader may reuse
/// a key only when its source is byte-identical.
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: BTreeMap<ShaderId, ShaderDefinition>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a definition, returning the previous one.
    pub fn insert(
        &mut self,
        shader: ShaderDefinition,
    ) -> Result<Option<ShaderDefinition>, LibraryError> {
        self.check_cache_key(shader.id(), shader.cache_key(), shader.source())?;
        Ok(self.shaders.insert(shader.id().clone(), shader))
    }

    pub fn get(&self, id: &ShaderId) -> Option<&ShaderDefinition> {
        self.shaders.get(id)
    }

    pub fn remove(&mut self, id: &ShaderId) -> Option<ShaderDefinition> {
        self.shaders.remove(id)
    }

    pub fn update_source(
        &mut self,
        id: &ShaderId,
        source: impl Into<String>,
        note: impl Into<String>,
    ) -> Result<&ShaderDefinition, LibraryError> {
        let source = source.into();
        let key = self
            .shaders
            .get(id)
            .ok_or_else(|| LibraryError::UnknownShader(id.clone()))?
            .cache_key()
            .to_string();
        self.check_cache_key(id, &key, &source)?;
        let shader = self
            .shaders
            .get_mut(id)
            .ok_or_else(|| LibraryError::UnknownShader(id.clone()))?;
        shader.update_source(source, note);
        Ok(&*shader)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ShaderDefinition> {
        self.shaders.values()
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    fn check_cache_key(&self, id: &ShaderId, key: &str, source: &str) -> Result<(), LibraryError> {
        let conflict = self
            .shaders
            .values()
            .find(|other| other.id() != id && other.cache_key() == key && other.source() != source);
        match conflict {
            Some(holder) => Err(LibraryError::CacheKeyConflict {
                key: key.to_string(),
                holder: holder.id().clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(id: &str, key: &str, source: &str) -> ShaderDefinition {
        ShaderDefinition::new(id, id, source).with_cache_key(key)
    }

    #[test]
    fn rejects_shared_cache_key_with_different_source() {
        let mut library = ShaderLibrary::new();
        library.insert(shader("a", "key", "fn main() {}")).unwrap();
        let err = library
            .insert(shader("b", "key", "fn main() { let x = 1; }"))
            .unwrap_err();
        assert_eq!(
            err,
            LibraryError::CacheKeyConflict {
                key: "key".into(),
                holder: ShaderId::new("a"),
            }
        );
        assert_eq!(library.len(), 1);
    }

    #[test]
    fn allows_shared_cache_key_with_identical_source() {
        let mut library = ShaderLibrary::new();
        library.insert(shader("a", "key", "fn main() {}")).unwrap();
        library.insert(shader("b", "key", "fn main() {}")).unwrap();
        assert_eq!(library.len(), 2);
    }

    #[test]
    fn update_source_checks_conflicts_and_unknown_ids() {
        let mut library = ShaderLibrary::new();
        library.insert(shader("a", "key", "fn main() {}")).unwrap();
        library.insert(shader("b", "key", "fn main() {}")).unwrap();

        let err = library
            .update_source(&ShaderId::new("a"), "// changed", "edit")
            .unwrap_err();
        assert!(matches!(err, LibraryError::CacheKeyConflict { .. }));

        let err = library
            .update_source(&ShaderId::new("missing"), "x", "edit")
            .unwrap_err();
        assert_eq!(err, LibraryError::UnknownShader(ShaderId::new("missing")));

        library.remove(&ShaderId::new("b"));
        let updated = library
            .update_source(&ShaderId::new("a"), "// @param k: 0, 1, 0\nfn main() {}", "edit")
            .unwrap();
        assert_eq!(updated.parameters().len(), 1);
    }
}
