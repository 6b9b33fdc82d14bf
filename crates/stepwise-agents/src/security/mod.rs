//! Security gate for filesystem and shell tools.
//!
//! Two pure checks run before any privileged tool executes: the command
//! allowlist and the path restriction. Neither touches the disk, since the
//! execution environment may not be local. What "not allowed" means is
//! decided by the restriction's [`ApprovalPolicy`].

pub mod glob;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stepwise_core::config::{ApprovalPolicy, RestrictionConfig};

pub use glob::matches;

/// Security violations.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SecurityError {
    /// Path resolves outside the restriction root.
    #[error("Path traversal: '{path}' is outside '{root}'")]
    PathTraversal {
        /// Offending path as resolved.
        path: String,
        /// Restriction root.
        root: String,
    },

    /// Command matches no allowlist pattern.
    #[error("Command not allowed: '{command}'")]
    CommandNotAllowed {
        /// Offending command, trimmed.
        command: String,
    },
}

/// What a tool call touches, as declared by the tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "camelCase")]
pub enum ToolAccess {
    /// No filesystem or shell access.
    Unrestricted,
    /// A filesystem path, absolute or relative to the restriction root.
    Path(PathBuf),
    /// A shell command line.
    Command(String),
}

/// Gate verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Execute immediately.
    Allowed {
        /// Normalized path for path-based access.
        resolved: Option<PathBuf>,
    },
    /// Outside the restriction; ask a human.
    NeedsApproval(SecurityError),
    /// Outside the restriction; refuse.
    Denied(SecurityError),
}

/// Check a command against allowlist patterns.
///
/// The command is trimmed, then must glob-match at least one pattern in
/// full. An empty pattern list allows nothing.
#[must_use]
pub fn evaluate_allowlist<S: AsRef<str>>(command: &str, patterns: &[S]) -> bool {
    let command = command.trim();
    patterns.iter().any(|p| glob::matches(command, p.as_ref()))
}

/// Lexically normalize a path, folding `.` and `..` segments.
///
/// `..` at the root of an absolute path stays at the root. Leading `..`
/// segments of a relative path are kept.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }

    out
}

/// Check whether `resolved` is `root` or a descendant of it.
///
/// Comparison is per path segment, so `/base-extra` is not inside
/// `/base`.
#[must_use]
pub fn is_within_restriction(resolved: &Path, root: &Path) -> bool {
    let resolved = normalize(resolved);
    let root = normalize(root);

    if resolved.components().any(|c| c == Component::ParentDir) {
        return false;
    }

    resolved.starts_with(&root)
}

/// Resolve `candidate` against `root` without checking containment.
///
/// Absolute candidates are only normalized; relative ones are joined to
/// the root first.
#[must_use]
pub fn resolve_against(candidate: &Path, root: &Path) -> PathBuf {
    if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root.join(candidate))
    }
}

/// Resolve `candidate` against `root` and ensure it stays inside.
///
/// Relative candidates are joined to the root before normalization.
///
/// # Errors
///
/// Returns `SecurityError::PathTraversal` if the resolved path escapes.
pub fn assert_safe_path(
    candidate: impl AsRef<Path>,
    root: impl AsRef<Path>,
) -> Result<PathBuf, SecurityError> {
    let root = normalize(root.as_ref());
    let resolved = resolve_against(candidate.as_ref(), &root);

    if is_within_restriction(&resolved, &root) {
        Ok(resolved)
    } else {
        Err(SecurityError::PathTraversal {
            path: resolved.display().to_string(),
            root: root.display().to_string(),
        })
    }
}

/// Absolute restriction root for an agent, given the environment's cwd.
#[must_use]
pub fn restriction_root(restriction: &RestrictionConfig, cwd: &Path) -> PathBuf {
    normalize(&cwd.join(&restriction.base_directory))
}

/// Classify a tool call against the active restriction.
#[must_use]
pub fn classify(access: &ToolAccess, restriction: &RestrictionConfig, root: &Path) -> GateDecision {
    let violation = match access {
        ToolAccess::Unrestricted => return GateDecision::Allowed { resolved: None },
        ToolAccess::Path(path) => match assert_safe_path(path, root) {
            Ok(resolved) => {
                return GateDecision::Allowed {
                    resolved: Some(resolved),
                };
            }
            Err(e) => e,
        },
        ToolAccess::Command(command) => {
            if evaluate_allowlist(command, &restriction.command_allowlist) {
                return GateDecision::Allowed { resolved: None };
            }
            SecurityError::CommandNotAllowed {
                command: command.trim().to_string(),
            }
        }
    };

    match restriction.approval {
        ApprovalPolicy::Ask => GateDecision::NeedsApproval(violation),
        ApprovalPolicy::Deny => GateDecision::Denied(violation),
    }
}
