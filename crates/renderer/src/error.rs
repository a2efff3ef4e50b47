use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A single compiler or validation message, positioned when the front end
/// could attribute it to a span of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(message: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{line}:{column}: {}", self.message),
            (Some(line), None) => write!(f, "{line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Everything the compiler had to say about a source that did not compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub label: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileFailure {
    pub fn new(label: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            label: label.into(),
            diagnostics,
        }
    }

    /// First positioned diagnostic, if any.
    pub fn primary(&self) -> Option<&Diagnostic> {
        self.diagnostics
            .iter()
            .find(|diagnostic| diagnostic.line.is_some())
            .or_else(|| self.diagnostics.first())
    }
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shader '{}' failed to compile", self.label)?;
        for diagnostic in &self.diagnostics {
            write!(f, "\n  {diagnostic}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU not supported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Compilation(CompileFailure),

    #[error("GPU execution failed: {0}")]
    Execution(String),

    #[error("failed to allocate {size} bytes: {reason}")]
    Allocation { size: u64, reason: String },

    #[error("invalid shader parameters: {0}")]
    ParameterValidation(String),

    #[error("failed to create pipeline: {0}")]
    PipelineCreation(String),

    #[error("GPU device was lost")]
    DeviceLost,

    #[error("cache key '{key}' is already bound to a different program")]
    CacheKeyConflict { key: String },

    #[error("GPU readback failed: {0}")]
    Readback(String),

    #[error("GPU readback did not finish within {:.0}ms", .0.as_secs_f64() * 1000.0)]
    ReadbackTimedOut(Duration),

    #[error("export failed: {0}")]
    Export(String),
}

impl From<CompileFailure> for GpuError {
    fn from(failure: CompileFailure) -> Self {
        GpuError::Compilation(failure)
    }
}

pub type GpuResult<T> = Result<T, GpuError>;
