//! Agent session restore: where a prior session's history file lives in the
//! guest, per agent family.

/// Root of the Claude Code state tree in the guest.
const CLAUDE_ROOT: &str = "/home/user/.claude";

/// Root of the Codex state tree in the guest.
const CODEX_ROOT: &str = "/home/user/.codex";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentFamily {
    ClaudeCode,
    Codex,
    Other,
}

fn family_of(cli_agent_type: &str) -> AgentFamily {
    // An empty tag selects the default agent (claude-code).
    if cli_agent_type.is_empty() || cli_agent_type.starts_with("claude-code") {
        AgentFamily::ClaudeCode
    } else if cli_agent_type.starts_with("codex") {
        AgentFamily::Codex
    } else {
        AgentFamily::Other
    }
}

/// Guest path the session history file must be written to, or `None` for
/// agent families without session restore.
///
/// Claude Code keys sessions by project: the working directory with every
/// `/` (including the leading one) turned into `-`. Codex keys by session id
/// alone.
pub fn session_history_path(
    cli_agent_type: &str,
    working_dir: &str,
    session_id: &str,
) -> Option<String> {
    match family_of(cli_agent_type) {
        AgentFamily::ClaudeCode => {
            let project = working_dir.replace('/', "-");
            Some(format!("{CLAUDE_ROOT}/projects/{project}/{session_id}.jsonl"))
        }
        AgentFamily::Codex => Some(format!("{CODEX_ROOT}/sessions/{session_id}.jsonl")),
        AgentFamily::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_code_path_encodes_working_dir() {
        let path = session_history_path(
            "claude-code",
            "/home/user/projects/myapp",
            "550e8400-e29b-41d4-a716-446655440000",
        )
        .unwrap();
        assert_eq!(
            path,
            "/home/user/.claude/projects/-home-user-projects-myapp/550e8400-e29b-41d4-a716-446655440000.jsonl"
        );
    }

    #[test]
    fn empty_agent_type_defaults_to_claude_code() {
        let path = session_history_path("", "/workspace", "s-1").unwrap();
        assert_eq!(path, "/home/user/.claude/projects/-workspace/s-1.jsonl");
    }

    #[test]
    fn codex_path_ignores_working_dir() {
        let a = session_history_path("codex", "/workspace", "s-1").unwrap();
        let b = session_history_path("codex", "/somewhere/else", "s-1").unwrap();
        assert_eq!(a, "/home/user/.codex/sessions/s-1.jsonl");
        assert_eq!(a, b);
    }

    #[test]
    fn claude_family_variants_match() {
        assert!(session_history_path("claude-code-max", "/w", "s").is_some());
    }

    #[test]
    fn unknown_agents_skip_restore() {
        assert_eq!(session_history_path("aider", "/w", "s"), None);
    }
}
