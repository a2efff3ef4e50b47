mod annotations;
mod definition;
mod library;
mod pack;

pub use annotations::{parse_iterations, parse_parameters, ParameterError, ShaderParameter};
pub use definition::{ChangelogEntry, ShaderDefinition};
pub use library::{LibraryError, ShaderLibrary};
pub use pack::{load_shader, PackError, ShaderPack, ShaderPackManifest};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a shader across source revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShaderId(pub String);

impl ShaderId {
    pub fn new(id: impl Into<String>) -> Self {
        ShaderId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShaderId {
    fn from(value: &str) -> Self {
        ShaderId::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_id_displays_raw_value() {
        let id = ShaderId::from("plasma-v3");
        assert_eq!(id.to_string(), "plasma-v3");
        assert_eq!(id.as_str(), "plasma-v3");
    }
}
