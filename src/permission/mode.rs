use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rejection message sent for every request while the mode is `DenyAll`.
pub const DENY_ALL_REASON: &str = "Permission mode is set to deny all tool use";

/// Tools auto-allowed in `AcceptEdits` mode.
const FILE_EDIT_TOOLS: &[&str] = &[
    "Write",
    "Edit",
    "MultiEdit",
    "CreateDirectory",
    "Move",
    "Copy",
    "Rename",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionMode {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions", alias = "allowAll")]
    AllowAll,
    #[serde(rename = "denyAll")]
    DenyAll,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::AllowAll => "bypassPermissions",
            Self::DenyAll => "denyAll",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "default" => Ok(Self::Default),
            "acceptEdits" | "accept-edits" | "accept_edits" => Ok(Self::AcceptEdits),
            "bypassPermissions" | "allowAll" | "allow-all" | "allow_all" => Ok(Self::AllowAll),
            "denyAll" | "deny-all" | "deny_all" => Ok(Self::DenyAll),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

/// Outcome of evaluating a request against the current mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeVerdict {
    Allow,
    Deny { reason: &'static str },
    /// The mode has no opinion; continue to memory and then a human.
    Escalate,
}

/// Stateless evaluation of the four permission modes.
///
/// The mode itself lives on the channel and only changes through an explicit
/// set call, so the policy carries no state of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModePolicy;

impl ModePolicy {
    pub fn evaluate(self, mode: PermissionMode, tool_name: &str) -> ModeVerdict {
        match mode {
            PermissionMode::Default => ModeVerdict::Escalate,
            PermissionMode::AllowAll => ModeVerdict::Allow,
            PermissionMode::DenyAll => ModeVerdict::Deny {
                reason: DENY_ALL_REASON,
            },
            PermissionMode::AcceptEdits if is_file_edit_tool(tool_name) => ModeVerdict::Allow,
            PermissionMode::AcceptEdits => ModeVerdict::Escalate,
        }
    }
}

pub fn is_file_edit_tool(tool_name: &str) -> bool {
    FILE_EDIT_TOOLS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(tool_name))
}

#[cfg(test)]
mod tests {
    use super::{ModePolicy, ModeVerdict, PermissionMode, DENY_ALL_REASON};

    #[test]
    fn default_mode_always_escalates() {
        assert_eq!(
            ModePolicy.evaluate(PermissionMode::Default, "Write"),
            ModeVerdict::Escalate
        );
    }

    #[test]
    fn accept_edits_only_covers_file_mutations() {
        for tool in ["Write", "Edit", "MultiEdit", "CreateDirectory", "Move", "Copy", "Rename"] {
            assert_eq!(
                ModePolicy.evaluate(PermissionMode::AcceptEdits, tool),
                ModeVerdict::Allow,
                "{tool}"
            );
        }
        assert_eq!(
            ModePolicy.evaluate(PermissionMode::AcceptEdits, "Bash"),
            ModeVerdict::Escalate
        );
        assert_eq!(
            ModePolicy.evaluate(PermissionMode::AcceptEdits, "Delete"),
            ModeVerdict::Escalate
        );
    }

    #[test]
    fn allow_and_deny_all_are_unconditional() {
        assert_eq!(
            ModePolicy.evaluate(PermissionMode::AllowAll, "Bash"),
            ModeVerdict::Allow
        );
        assert_eq!(
            ModePolicy.evaluate(PermissionMode::DenyAll, "Read"),
            ModeVerdict::Deny {
                reason: DENY_ALL_REASON
            }
        );
    }

    #[test]
    fn parses_wire_and_cli_spellings() {
        assert_eq!("acceptEdits".parse::<PermissionMode>(), Ok(PermissionMode::AcceptEdits));
        assert_eq!("allow-all".parse::<PermissionMode>(), Ok(PermissionMode::AllowAll));
        assert_eq!("bypassPermissions".parse::<PermissionMode>(), Ok(PermissionMode::AllowAll));
        assert!("sometimes".parse::<PermissionMode>().is_err());
    }

    #[test]
    fn serde_uses_worker_names() {
        let encoded = serde_json::to_string(&PermissionMode::AllowAll).unwrap();
        assert_eq!(encoded, "\"bypassPermissions\"");
        let decoded: PermissionMode = serde_json::from_str("\"allowAll\"").unwrap();
        assert_eq!(decoded, PermissionMode::AllowAll);
    }
}
