//! Compilation of an authored description into the normalized tables.
//!
//! `verifier` checks structural rules on the definition tree; `lowering`
//! assigns ids, resolves targets, and emits the flat tables. All defects are
//! collected into one findings list so authors see every problem at once.

mod lowering;
mod verifier;

use std::fmt;

use thiserror::Error;

pub(crate) use lowering::normalize;

/// One defect found while building a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub message: String,
    /// Absolute path of the offending state, when known.
    pub path: Option<String>,
}

impl Finding {
    pub(crate) fn new(message: impl Into<String>, path: Option<&str>) -> Self {
        Self {
            message: message.into(),
            path: path.map(str::to_string),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "[{}] {}", path, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// All findings of one failed build, newline-joined for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Findings(pub Vec<Finding>);

impl fmt::Display for Findings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, finding) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{finding}")?;
        }
        Ok(())
    }
}

/// Fatal build-time error: the model is refused.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("model verification failed:\n{0}")]
    Verification(Findings),
}

impl BuildError {
    /// The individual findings behind this error.
    pub fn findings(&self) -> &[Finding] {
        match self {
            BuildError::Verification(findings) => &findings.0,
        }
    }
}
