//! Read-only loading of shaders from disk.
//!
//! A shader is either a bare `.wgsl` file or a pack directory holding a
//! `shader.toml` manifest next to its source:
//!
//! ```toml
//! name = "Reaction diffusion"
//! description = "Gray-Scott with a slowly rotating feed map"
//! entry = "shader.wgsl"
//! iterations = 16
//! ```
//!
//! Packs are how the CLI feeds shaders to the renderer; the renderer itself
//! only ever sees [`ShaderDefinition`]s.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ShaderDefinition, ShaderId};

const MANIFEST_FILE: &str = "shader.toml";

#[derive(Debug, Error)]
pub enum PackError {
    #[error("shader path {0} does not exist")]
    Missing(PathBuf),

    #[error("manifest not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(#[from] toml::de::Error),

    #[error("manifest validation failed: {0:?}")]
    ManifestValidation(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShaderPackManifest {
    pub name: Option<String>,
    #[serde(default = "default_entry")]
    pub entry: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub cache_key: Option<String>,
}

fn default_entry() -> PathBuf {
    PathBuf::from("shader.wgsl")
}

impl ShaderPackManifest {
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.entry.as_os_str().is_empty() {
            issues.push("entry must not be empty".to_string());
        }
        if self.entry.is_absolute() {
            issues.push(format!(
                "entry '{}' must be relative to the pack directory",
                self.entry.display()
            ));
        }
        if self.iterations == Some(0) {
            issues.push("iterations must be greater than zero when set".to_string());
        }
        if let Some(key) = &self.cache_key {
            if key.trim().is_empty() {
                issues.push("cache_key must not be blank when set".to_string());
            }
        }
        issues
    }
}

#[derive(Debug, Clone)]
pub struct ShaderPack {
    root: PathBuf,
    manifest: ShaderPackManifest,
}

impl ShaderPack {
    pub fn load(root: impl AsRef<Path>) -> Result<Self, PackError> {
        let root = root.as_ref().to_path_buf();
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(PackError::ManifestMissing(manifest_path));
        }

        let manifest_raw = fs::read_to_string(&manifest_path)?;
        let manifest: ShaderPackManifest = toml::from_str(&manifest_raw)?;
        let issues = manifest.validate();
        if !issues.is_empty() {
            return Err(PackError::ManifestValidation(issues));
        }

        Ok(Self { root, manifest })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ShaderPackManifest {
        &self.manifest
    }

    pub fn entry_path(&self) -> PathBuf {
        self.root.join(&self.manifest.entry)
    }

    pub fn into_definition(self) -> Result<ShaderDefinition, PackError> {
        let source_path = self.entry_path();
        if !source_path.exists() {
            return Err(PackError::ManifestValidation(vec![format!(
                "entry source {} is missing",
                source_path.display()
            )]));
        }
        let source = fs::read_to_string(&source_path)?;
        let id = stem_id(&self.root);
        let name = self.manifest.name.clone().unwrap_or_else(|| id.0.clone());
        let mut shader = ShaderDefinition::new(id, name, source)
            .with_iterations(self.manifest.iterations);
        if let Some(key) = self.manifest.cache_key {
            shader = shader.with_cache_key(key);
        }
        if let Some(description) = self.manifest.description {
            shader = shader.with_description(description);
        }
        Ok(shader)
    }
}

/// Loads a shader from a pack directory or a bare source file.
pub fn load_shader(path: impl AsRef<Path>) -> Result<ShaderDefinition, PackError> {
    let path = path.as_ref();
    if path.is_dir() {
        return ShaderPack::load(path)?.into_definition();
    }
    if !path.exists() {
        return Err(PackError::Missing(path.to_path_buf()));
    }
    let source = fs::read_to_string(path)?;
    let id = stem_id(path);
    Ok(ShaderDefinition::new(id.clone(), id.0, source))
}

fn stem_id(path: &Path) -> ShaderId {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("shader");
    ShaderId::new(stem)
}
