//! Boundary validation for remote control input.
//!
//! Everything a remote operator types that could reach the agent's stdin
//! goes through here first. Validation failures stop at the boundary; they
//! never reach the permission queue or the subprocess.

use crate::error::SecurityError;

/// Shell metacharacters that are never allowed in any remote input.
const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '$', '`', '\\', '\n', '\r', '>', '<', '(', ')', '{', '}', '[', ']', '!', '#',
    '*', '?', '~',
];

/// Validate a control command against the configured allowlist.
///
/// Returns the normalized command on success. The base command must appear
/// in `allowed`; arguments are restricted to a conservative character set,
/// and commands that drive a sprint require a `sprint-N` argument.
pub fn validate_control_command(
    command: &str,
    allowed: &[String],
) -> Result<String, SecurityError> {
    // Reject metacharacters before any normalization so newline smuggling
    // cannot survive the whitespace collapse below.
    if let Some(ch) = command.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(SecurityError::InvalidInput(format!(
            "disallowed character {ch:?} in command"
        )));
    }

    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(SecurityError::InvalidInput("command is empty".into()));
    }

    let mut parts = normalized.splitn(2, ' ');
    let base = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or_default();

    if !allowed.iter().any(|a| a == base) {
        return Err(SecurityError::InvalidInput(format!(
            "unknown command: {base}"
        )));
    }

    if requires_sprint_argument(base) {
        let first = args.split(' ').next().unwrap_or_default();
        if !is_sprint_identifier(first) {
            return Err(SecurityError::InvalidInput(format!(
                "{base} requires a sprint-N argument (N is 1-99)"
            )));
        }
    }

    for arg in args.split(' ').filter(|a| !a.is_empty()) {
        if !arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
        {
            return Err(SecurityError::InvalidInput(format!(
                "disallowed characters in argument: {}",
                sanitize_for_display(arg, 40)
            )));
        }
    }

    Ok(normalized)
}

fn requires_sprint_argument(base: &str) -> bool {
    matches!(base, "/implement" | "/review-sprint" | "/audit-sprint" | "/run")
}

fn is_sprint_identifier(arg: &str) -> bool {
    let Some(n) = arg.strip_prefix("sprint-") else {
        return false;
    };
    matches!(n.parse::<u32>(), Ok(v) if (1..=99).contains(&v) && !n.starts_with('0'))
}

/// Validate a permission request id arriving in callback data.
///
/// Ids are opaque UUID fragments: alphanumeric plus hyphens, 8 to 64 chars.
pub fn validate_request_id(request_id: &str) -> Result<&str, SecurityError> {
    let ok = (8..=64).contains(&request_id.len())
        && request_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(request_id)
    } else {
        Err(SecurityError::InvalidInput(
            "invalid request id format".into(),
        ))
    }
}

/// Make arbitrary text safe to echo back in an operator-facing message.
///
/// Escapes markup-significant characters, strips control characters, and
/// truncates to `max_length`.
pub fn sanitize_for_display(text: &str, max_length: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_length));
    for ch in text.chars() {
        if out.len() >= max_length {
            out.push('…');
            break;
        }
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Vec<String> {
        ["/implement", "/plan", "/halt", "/archive-cycle"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn accepts_allowlisted_command_with_sprint() {
        let got = validate_control_command("/implement sprint-3", &allowlist()).unwrap();
        assert_eq!(got, "/implement sprint-3");
    }

    #[test]
    fn normalizes_interior_whitespace() {
        let got = validate_control_command("  /plan   ", &allowlist()).unwrap();
        assert_eq!(got, "/plan");
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(validate_control_command("/rm-rf", &allowlist()).is_err());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for cmd in [
            "/plan; rm -rf /",
            "/plan && echo hi",
            "/plan `id`",
            "/plan $(id)",
            "/plan\nrm -rf /",
        ] {
            assert!(
                validate_control_command(cmd, &allowlist()).is_err(),
                "accepted: {cmd}"
            );
        }
    }

    #[test]
    fn sprint_commands_require_sprint_argument() {
        assert!(validate_control_command("/implement", &allowlist()).is_err());
        assert!(validate_control_command("/implement sprint-0", &allowlist()).is_err());
        assert!(validate_control_command("/implement sprint-100", &allowlist()).is_err());
        assert!(validate_control_command("/implement sprint-42", &allowlist()).is_ok());
    }

    #[test]
    fn request_id_shape_is_enforced() {
        assert!(validate_request_id("ab12cd34").is_ok());
        assert!(validate_request_id("ab12cd34-ef56").is_ok());
        assert!(validate_request_id("short").is_err());
        assert!(validate_request_id("ab12cd34; DROP").is_err());
        assert!(validate_request_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn sanitize_escapes_markup_and_truncates() {
        let got = sanitize_for_display("<script>alert(1)</script>", 200);
        assert!(!got.contains('<'));
        assert!(got.contains("&lt;script&gt;"));

        let long = sanitize_for_display(&"a".repeat(500), 50);
        assert!(long.chars().count() <= 51);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize_for_display("a\x1b[31mb", 20), "a [31mb");
    }
}
