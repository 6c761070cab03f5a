//! Graphics error types.

use std::fmt;

/// Errors that can occur in the graphics core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    InitializationFailed(String),
    /// No adapter on the host satisfies the minimum requirements.
    ///
    /// Carries one human-readable report line per disqualified adapter.
    NoCompatibleAdapter(Vec<String>),
    /// Failed to create a resource.
    ResourceCreationFailed(String),
    /// A requested feature is not supported by the selected adapter.
    FeatureNotSupported(String),
    /// Out of GPU memory.
    OutOfMemory,
    /// The GPU device was lost.
    DeviceLost,
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::NoCompatibleAdapter(reports) => {
                write!(f, "no compatible adapter found ({} probed)", reports.len())
            }
            Self::ResourceCreationFailed(msg) => write!(f, "resource creation failed: {msg}"),
            Self::FeatureNotSupported(msg) => write!(f, "feature not supported: {msg}"),
            Self::OutOfMemory => write!(f, "out of GPU memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GraphicsError {}

/// Diagnostic text produced by a shader or pipeline compilation attempt.
///
/// Drivers and translators report warnings and errors through the same
/// channel; [`CompileDiagnostic::is_benign`] distinguishes a
/// succeeded-with-warnings report from a genuine failure by inspecting the
/// text for the known success marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDiagnostic {
    /// Full diagnostic text as reported by the driver or translator.
    pub text: String,
}

/// Marker emitted by driver compilers whose "error" object actually reports
/// a successful compilation that only produced warnings.
pub const COMPILE_SUCCESS_MARKER: &str = "Compilation succeeded";

impl CompileDiagnostic {
    /// Create a diagnostic from the reported text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Whether this diagnostic reports a successful compile that only
    /// produced warnings.
    pub fn is_benign(&self) -> bool {
        self.text.contains(COMPILE_SUCCESS_MARKER)
    }
}

impl fmt::Display for CompileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");
    }

    #[test]
    fn test_no_compatible_adapter_report_count() {
        let err = GraphicsError::NoCompatibleAdapter(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "no compatible adapter found (2 probed)");
    }

    #[test]
    fn test_diagnostic_benign_marker() {
        let warn = CompileDiagnostic::new("Compilation succeeded: 2 warnings generated");
        assert!(warn.is_benign());

        let fail = CompileDiagnostic::new("error: undeclared identifier 'foo'");
        assert!(!fail.is_benign());
    }
}
