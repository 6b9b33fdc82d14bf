//! Security gate dry runs.

use crate::ui::{self, Verdict};
use anyhow::Result;
use std::path::{Path, PathBuf};
use stepwise_agents::security::{GateDecision, ToolAccess, classify, restriction_root};
use stepwise_core::{Config, RestrictionConfig};

/// What to check.
#[derive(Debug, Clone)]
pub enum CheckTarget {
    /// A shell command line.
    Command(String),
    /// A filesystem path.
    Path(PathBuf),
}

/// Check command arguments.
#[derive(Debug, Clone)]
pub struct CheckArgs {
    /// Target to classify.
    pub target: CheckTarget,
    /// Agent whose restriction applies.
    pub agent: String,
    /// Working directory the restriction root is resolved against.
    pub cwd: PathBuf,
}

/// Classify the target the way the tool executor would.
pub fn run_check(args: &CheckArgs, config: &Config) -> Result<()> {
    let restriction = &config.agent(&args.agent)?.restriction;
    let root = restriction_root(restriction, &args.cwd);

    ui::header(&format!("Agent '{}'", args.agent));
    ui::kv("root", &root.display().to_string());
    ui::kv("allowlist", &restriction.command_allowlist.join(", "));

    let (subject, decision) = evaluate(&args.target, restriction, &root);
    let (verdict, detail) = describe(&decision);
    ui::verdict(&subject, verdict, &detail);
    Ok(())
}

fn evaluate(target: &CheckTarget, restriction: &RestrictionConfig, root: &Path) -> (String, GateDecision) {
    let (subject, access) = match target {
        CheckTarget::Command(command) => (command.trim().to_string(), ToolAccess::Command(command.clone())),
        CheckTarget::Path(path) => (path.display().to_string(), ToolAccess::Path(path.clone())),
    };
    (subject, classify(&access, restriction, root))
}

fn describe(decision: &GateDecision) -> (Verdict, String) {
    match decision {
        GateDecision::Allowed { resolved } => (
            Verdict::Allowed,
            resolved
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
        GateDecision::NeedsApproval(violation) => (Verdict::NeedsApproval, violation.to_string()),
        GateDecision::Denied(violation) => (Verdict::Denied, violation.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::ApprovalPolicy;

    fn restriction(approval: ApprovalPolicy) -> RestrictionConfig {
        RestrictionConfig::new("project")
            .with_allowlist(["git *", "npm test"])
            .with_approval(approval)
    }

    #[test]
    fn test_command_verdicts() {
        let root = Path::new("/home/dev/project");
        let ask = restriction(ApprovalPolicy::Ask);
        let deny = restriction(ApprovalPolicy::Deny);

        let (subject, decision) = evaluate(&CheckTarget::Command("  git status ".into()), &ask, root);
        assert_eq!(subject, "git status");
        assert_eq!(describe(&decision).0, Verdict::Allowed);

        let (_, decision) = evaluate(&CheckTarget::Command("npm install".into()), &ask, root);
        assert_eq!(describe(&decision).0, Verdict::NeedsApproval);

        let (_, decision) = evaluate(&CheckTarget::Command("npm install".into()), &deny, root);
        let (verdict, detail) = describe(&decision);
        assert_eq!(verdict, Verdict::Denied);
        assert!(detail.contains("npm install"));
    }

    #[test]
    fn test_path_verdicts() {
        let root = restriction_root(&restriction(ApprovalPolicy::Ask), Path::new("/home/dev"));
        assert_eq!(root, PathBuf::from("/home/dev/project"));

        let (_, decision) = evaluate(
            &CheckTarget::Path("src/../README.md".into()),
            &restriction(ApprovalPolicy::Ask),
            &root,
        );
        assert_eq!(
            describe(&decision),
            (Verdict::Allowed, "/home/dev/project/README.md".to_string())
        );

        let (_, decision) = evaluate(
            &CheckTarget::Path("../other".into()),
            &restriction(ApprovalPolicy::Ask),
            &root,
        );
        assert_eq!(describe(&decision).0, Verdict::NeedsApproval);
    }
}
