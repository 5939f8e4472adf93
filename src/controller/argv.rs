//! Turns the flat `bgpipe [GLOBAL-OPTS] STAGE [STAGE-OPTS] ... -- STAGE ...`
//! argv tail into an ordered list of [`StageConfig`]s.

use std::net::{IpAddr, SocketAddr};

use crate::config::StageConfig;

/// One raw stage slice before a command has assigned it to a concrete
/// implementation: the classified command name plus its own argv tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStage {
    pub command: String,
    pub args: Vec<String>,
}

/// True when `token` is a bare `host:port`/IP literal, classified as a
/// synthetic `tcp` stage-start.
fn looks_like_tcp_target(token: &str) -> bool {
    if token.parse::<IpAddr>().is_ok() {
        return true;
    }
    if token.parse::<SocketAddr>().is_ok() {
        return true;
    }
    // host:port where host isn't a literal IP — cheapest check is "exactly
    // one colon, non-empty host, numeric port".
    if let Some((host, port)) = token.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() {
            return true;
        }
    }
    false
}

/// True when `token` is a filesystem path, classified as a synthetic `mrt`
/// stage-start (a path starting with `.` or `/`).
fn looks_like_mrt_path(token: &str) -> bool {
    token.starts_with('.') || token.starts_with('/')
}

/// Classifies a stage-start token into its command name: (a) a registered
/// command name, (b) parseable as an IP-address or host:port, or (c) a
/// filesystem path. `known_commands` is consulted for (a); (b)/(c) are
/// synthetic fallbacks.
fn classify_stage_start(token: &str, known_commands: &[&str]) -> Option<&'static str> {
    if known_commands.contains(&token) {
        return Some(known_commands.iter().find(|&&c| c == token).copied().unwrap());
    }
    if looks_like_mrt_path(token) {
        return Some("mrt");
    }
    if looks_like_tcp_target(token) {
        return Some("tcp");
    }
    None
}

/// How many bare (non-flag) positional tokens a stage command consumes
/// before a subsequent synthetic-looking token (bare address/path) is read
/// as a new stage-start rather than this stage's own argument. A *literal*
/// registered command name always starts a new stage regardless of arity;
/// this table only resolves the ambiguity for the synthetic address/path
/// heuristics.
fn positional_arity(command: &str) -> usize {
    match command {
        "tcp" | "listen" | "mrt" | "exec" => 1,
        _ => 0,
    }
}

/// Tokenizes the stage argv tail into [`RawStage`]s. `--` always forces a
/// new stage boundary; otherwise a new stage starts whenever the next token
/// classifies as a stage-start.
pub fn tokenize_stages(tail: &[String], known_commands: &[&str]) -> anyhow::Result<Vec<RawStage>> {
    let mut stages = Vec::new();
    let mut i = 0;
    while i < tail.len() {
        let token = &tail[i];
        if token == "--" {
            i += 1;
            continue;
        }
        let Some(command) = classify_stage_start(token, known_commands) else {
            anyhow::bail!(
                "unexpected token '{token}' at position {i}: expected a stage command, IP/host:port, or path"
            );
        };
        let consumed_command_token = known_commands.contains(&token.as_str());
        i += 1;
        let mut args = Vec::new();
        let mut positionals_left = positional_arity(command);
        if !consumed_command_token {
            // synthetic command (tcp/mrt): the classifying token is itself
            // the stage's first argument (the address or path).
            args.push(token.clone());
            positionals_left = positionals_left.saturating_sub(1);
        }
        while i < tail.len() {
            let t = &tail[i];
            if t == "--" {
                i += 1;
                break;
            }
            let is_literal_command = known_commands.contains(&t.as_str());
            let is_synthetic_start = !is_literal_command && classify_stage_start(t, known_commands).is_some();
            if is_literal_command {
                break;
            }
            if is_synthetic_start && !t.starts_with('-') {
                if positionals_left == 0 {
                    break;
                }
                positionals_left -= 1;
            }
            args.push(t.clone());
            i += 1;
        }
        stages.push(RawStage {
            command: command.to_string(),
            args,
        });
    }
    Ok(stages)
}

/// Builds a [`StageConfig`] from a [`RawStage`]'s argv slice: `--flag value`
/// / `--flag` (boolean) / positional, via a small ad hoc flag scanner.
pub fn parse_stage_flags(raw: &RawStage) -> StageConfig {
    let mut config = StageConfig::new(raw.command.clone());
    let mut i = 0;
    while i < raw.args.len() {
        let tok = &raw.args[i];
        if let Some(flag) = tok.strip_prefix("--") {
            if let Some((name, value)) = flag.split_once('=') {
                config.flags.insert(name.to_string(), value.to_string());
                i += 1;
                continue;
            }
            let takes_value = raw
                .args
                .get(i + 1)
                .is_some_and(|next| !next.starts_with('-'));
            if takes_value {
                config.flags.insert(flag.to_string(), raw.args[i + 1].clone());
                i += 2;
            } else {
                config.flags.insert(flag.to_string(), String::new());
                i += 1;
            }
        } else if let Some(flag) = tok.strip_prefix('-') {
            if flag.len() == 1 {
                config.flags.insert(flag.to_string(), String::new());
                i += 1;
            } else {
                config.positionals.push(tok.clone());
                i += 1;
            }
        } else {
            config.positionals.push(tok.clone());
            i += 1;
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: &[&str] = &["tcp", "listen", "mrt", "speaker", "stdin", "stdout", "exec"];

    #[test]
    fn classifies_registered_command() {
        let toks = vec!["speaker".to_string(), "--active".to_string()];
        let stages = tokenize_stages(&toks, KNOWN).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].command, "speaker");
        assert_eq!(stages[0].args, vec!["--active".to_string()]);
    }

    #[test]
    fn classifies_bare_host_port_as_tcp() {
        let toks = vec!["192.0.2.1:179".to_string()];
        let stages = tokenize_stages(&toks, KNOWN).unwrap();
        assert_eq!(stages[0].command, "tcp");
        assert_eq!(stages[0].args, vec!["192.0.2.1:179".to_string()]);
    }

    #[test]
    fn classifies_dot_path_as_mrt() {
        let toks = vec!["./dump.mrt.gz".to_string()];
        let stages = tokenize_stages(&toks, KNOWN).unwrap();
        assert_eq!(stages[0].command, "mrt");
    }

    #[test]
    fn double_dash_separates_two_known_stages() {
        let toks = vec![
            "tcp".to_string(),
            "192.0.2.1:179".to_string(),
            "--".to_string(),
            "stdout".to_string(),
        ];
        let stages = tokenize_stages(&toks, KNOWN).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].command, "tcp");
        assert_eq!(stages[1].command, "stdout");
    }

    #[test]
    fn tee_through_tokenizes_three_stages() {
        // argv `tcp 192.0.2.1:179 exec ./filter.sh stdout`
        let toks = vec![
            "tcp".to_string(),
            "192.0.2.1:179".to_string(),
            "exec".to_string(),
            "./filter.sh".to_string(),
            "stdout".to_string(),
        ];
        let stages = tokenize_stages(&toks, KNOWN).unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].command, "tcp");
        assert_eq!(stages[0].args, vec!["192.0.2.1:179".to_string()]);
        assert_eq!(stages[1].command, "exec");
        assert_eq!(stages[1].args, vec!["./filter.sh".to_string()]);
        assert_eq!(stages[2].command, "stdout");
    }

    #[test]
    fn flag_with_value_and_boolean_flag() {
        let raw = RawStage {
            command: "tcp".into(),
            args: vec!["--timeout".into(), "30".into(), "--retry".into()],
        };
        let cfg = parse_stage_flags(&raw);
        assert_eq!(cfg.flags.get("timeout").map(|s| s.as_str()), Some("30"));
        assert_eq!(cfg.flags.get("retry").map(|s| s.as_str()), Some(""));
    }

    #[test]
    fn positional_after_flags() {
        let raw = RawStage {
            command: "tcp".into(),
            args: vec!["192.0.2.1:179".into(), "--retry".into()],
        };
        let cfg = parse_stage_flags(&raw);
        assert_eq!(cfg.positionals, vec!["192.0.2.1:179".to_string()]);
    }
}
