//! Static command guard.
//!
//! Rejects known-dangerous shell commands before any process is created.
//! This is a pattern filter, not a proof of safety: it is always paired with
//! container isolation or, in fallback mode, the local executor's limits.
//!
//! The check is pure. The same input always yields the same verdict.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A dangerous-command pattern and the reason reported when it matches.
struct DangerousPattern {
    pattern: Regex,
    description: &'static str,
}

impl DangerousPattern {
    fn new(pattern: &str, description: &'static str) -> Self {
        Self {
            // Patterns are compile-time constants covered by tests.
            pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid guard pattern {pattern}: {e}")),
            description,
        }
    }
}

/// Ordered pattern list. First match wins.
static DANGEROUS_PATTERNS: Lazy<Vec<DangerousPattern>> = Lazy::new(|| {
    [
        // ── Recursive deletion ─────────────────────────────────────
        (
            r#"\brm\s+(-[a-zA-Z-]+\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(-[a-zA-Z-]+\s+)*["']?(/|/\*)["']?(\s|$|[;&|])"#,
            "recursive deletion of the root filesystem",
        ),
        (
            r#"\brm\s+(-[a-zA-Z-]+\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(-[a-zA-Z-]+\s+)*["']?(~|\$HOME|\$\{HOME\})(/|/\*)?["']?(\s|$|[;&|])"#,
            "recursive deletion of the home directory",
        ),
        (
            r#"\brm\s+(-[a-zA-Z-]+\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(-[a-zA-Z-]+\s+)*["']?(\*|\.\*)["']?(\s|$|[;&|])"#,
            "recursive deletion of everything in the current directory",
        ),
        (r"\brm\s.*--no-preserve-root", "deletion with --no-preserve-root"),
        (r"\brm\s.*/etc/(passwd|shadow)\b", "deletion of system account files"),
        (r"\brm\s.*\s/boot(/|\s|$)", "deletion of the boot partition"),
        // ── Windows deletion ───────────────────────────────────────
        (r"(?i)\bdel\s+(.*\s)?/f\b", "forced delete (Windows)"),
        (r"(?i)\bdel\s+(.*\s)?/s\b", "recursive delete (Windows)"),
        (r"(?i)\brd\s+(.*\s)?/s\b", "recursive directory removal (Windows)"),
        (r"(?i)\brmdir\s+(.*\s)?/s\b", "recursive directory removal (Windows)"),
        // ── Disk formatting and partitioning ───────────────────────
        (r"(?i)\bformat(\.com|\.exe)?\s+[a-z]:", "disk formatting"),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem creation"),
        (r"\bfdisk\b", "disk partitioning"),
        (r"\bparted\b", "disk partitioning"),
        (r"\bgdisk\b", "disk partitioning"),
        (r"(?i)\bdiskpart\b", "disk partitioning (Windows)"),
        // ── Raw block device writes ────────────────────────────────
        (
            r"\bdd\s+.*\bof=/dev/(sd|hd|nvme|vd|xvd)[a-z0-9]*",
            "raw write to a block device",
        ),
        (
            r">\s*/dev/(sd|hd|nvme|vd|xvd)[a-z0-9]*",
            "redirection into a block device",
        ),
        // ── Power state ────────────────────────────────────────────
        // Command position only: start, after a separator or subshell, or after sudo
        (r"(^|[;&|(`]\s*|\bsudo\s+)shutdown\b", "system shutdown"),
        (r"(^|[;&|(`]\s*|\bsudo\s+)reboot\b", "system reboot"),
        (r"(^|[;&|(`]\s*|\bsudo\s+)poweroff\b", "system power off"),
        (r"(^|[;&|(`]\s*|\bsudo\s+)halt\b", "system halt"),
        (
            r"(^|[;&|(`]\s*|\bsudo\s+)(init|telinit)\s+[06]\b",
            "runlevel change to halt or reboot",
        ),
        (
            r"\bsystemctl\s+(halt|poweroff|reboot)\b",
            "system power state change via systemctl",
        ),
        // ── Fork bombs ─────────────────────────────────────────────
        (
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
        (
            r"\b\w+\s*\(\s*\)\s*\{\s*\w+\s*\|\s*\w+\s*&\s*\}\s*;",
            "fork bomb (named function)",
        ),
        (
            r"\bwhile\s+(true|:|\[\s*1\s*\])\s*;\s*do\b.*&\s*done",
            "unbounded background process loop",
        ),
        (r"\bfork\s*while\s*fork\b", "fork bomb (perl)"),
        (r"while\s*\(\s*1\s*\)\s*\{?\s*fork", "fork bomb (loop)"),
        (r"(?i)while\s+true\s*:.*os\.fork\(", "fork bomb (python)"),
        // ── Secure wipe ────────────────────────────────────────────
        (r"\bshred\b", "secure file wipe"),
        (r"\bwipefs\b", "filesystem signature wipe"),
        (r"\bblkdiscard\b", "block device discard"),
        // ── Kernel interfaces ──────────────────────────────────────
        (r">\s*/proc/", "write to /proc"),
        (r">\s*/sys/", "write to /sys"),
        (r"\btee\s+(-a\s+)?/(proc|sys)/", "write to /proc or /sys"),
        // ── Permissions on root ────────────────────────────────────
        (
            r"\bchmod\s+(-[a-zA-Z]+\s+)*0?777\s+/(\s|$|[;&|])",
            "world-writable permissions on root",
        ),
        (
            r"\bchown\s+(-[a-zA-Z]+\s+)*\S+\s+/(\s|$|[;&|])",
            "ownership change of root",
        ),
        // ── System files ───────────────────────────────────────────
        (r">\s*/etc/(passwd|shadow)\b", "overwrite of system account files"),
        (r"\bmv\s.*/etc/(passwd|shadow)\b", "move of system account files"),
        // ── Remote code execution ──────────────────────────────────
        (
            r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(\S*/)?(ba|z|da|k)?sh\b",
            "remote script piped into a shell",
        ),
        (
            r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(\S*/)?(python[0-9.]*|perl|ruby|node)\b",
            "remote script piped into an interpreter",
        ),
        (
            r"\b(ba|z)?sh\s+<\s*\(\s*(curl|wget)\b",
            "remote script executed through process substitution",
        ),
    ]
    .into_iter()
    .map(|(pattern, description)| DangerousPattern::new(pattern, description))
    .collect()
});

static HEX_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\x[0-9a-fA-F]{2}").unwrap_or_else(|e| panic!("invalid hex pattern: {e}"))
});

static OCTAL_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\[0-7]{3}").unwrap_or_else(|e| panic!("invalid octal pattern: {e}"))
});

static BASE64_TO_SHELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bbase64\s+(-d|-D|--decode)\b.*\|\s*(sudo\s+)?(\S*/)?(ba|z|da|k)?sh\b")
        .unwrap_or_else(|e| panic!("invalid base64 pattern: {e}"))
});

static EVAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\beval\b").unwrap_or_else(|e| panic!("invalid eval pattern: {e}")));

/// Reason reported when the obfuscation heuristic fires.
pub const OBFUSCATION_REASON: &str = "command appears to be obfuscated";

/// Reason reported for blank commands.
pub const EMPTY_REASON: &str = "empty command";

/// Verdict for a single command, produced per check and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    /// Whether the command may run
    pub allowed: bool,
    /// Why the command was blocked (empty when allowed)
    pub reason: String,
    /// The command as submitted
    pub command: String,
}

/// Check a command. Returns `None` when allowed, or the block reason.
pub fn guard_command(command: &str) -> Option<String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Some(EMPTY_REASON.to_string());
    }

    if let Some(hit) = DANGEROUS_PATTERNS
        .iter()
        .find(|p| p.pattern.is_match(trimmed))
    {
        return Some(hit.description.to_string());
    }

    if contains_obfuscation(trimmed) {
        return Some(OBFUSCATION_REASON.to_string());
    }

    None
}

/// Check a command and wrap the verdict in a [`GuardResult`].
pub fn check_command(command: &str) -> GuardResult {
    let reason = guard_command(command);
    GuardResult {
        allowed: reason.is_none(),
        reason: reason.unwrap_or_default(),
        command: command.to_string(),
    }
}

/// Heuristics for commands that try to hide their payload from the pattern list.
pub fn contains_obfuscation(command: &str) -> bool {
    if command.contains('\0') {
        return true;
    }

    let backslashes = command.matches('\\').count();
    if backslashes > 10 && backslashes * 10 > command.len() {
        return true;
    }

    if HEX_ESCAPE.find_iter(command).count() > 5 {
        return true;
    }

    if OCTAL_ESCAPE.find_iter(command).count() > 5 {
        return true;
    }

    if BASE64_TO_SHELL.is_match(command) {
        return true;
    }

    if EVAL.is_match(command) {
        let subshell = command.contains("$(") || command.contains('`');
        let decode = command.contains("base64")
            || command.contains("xxd -r")
            || command.contains("\\x");
        if subshell || decode {
            return true;
        }
    }

    false
}

/// Number of patterns in the static list.
pub fn pattern_count() -> usize {
    DANGEROUS_PATTERNS.len()
}
