//! Seccomp profiles in the OCI/Docker JSON shape.
//!
//! Three profiles are built in:
//! - `default`: `SCMP_ACT_ERRNO` default action plus an `ERRNO` rule naming
//!   dangerous syscalls;
//! - `strict`: the same layout with a larger deny set;
//! - `minimal`: `SCMP_ACT_ERRNO` default with a single `ALLOW` rule.
//!
//! Anything else is looked up as `<profile_dir>/<name>.json`. Resolved
//! profiles are immutable and cached by name in [`SeccompRegistry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Built-in profile names.
pub const BUILTIN_PROFILES: &[&str] = &["default", "strict", "minimal"];

/// Syscalls refused by the `default` profile.
const DANGEROUS_SYSCALLS: &[&str] = &[
    "acct",
    "add_key",
    "bpf",
    "clock_adjtime",
    "clock_settime",
    "create_module",
    "delete_module",
    "finit_module",
    "get_kernel_syms",
    "get_mempolicy",
    "init_module",
    "ioperm",
    "iopl",
    "kcmp",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "lookup_dcookie",
    "mbind",
    "mount",
    "move_pages",
    "name_to_handle_at",
    "nfsservctl",
    "open_by_handle_at",
    "perf_event_open",
    "personality",
    "pivot_root",
    "process_vm_readv",
    "process_vm_writev",
    "ptrace",
    "query_module",
    "quotactl",
    "reboot",
    "request_key",
    "set_mempolicy",
    "setns",
    "settimeofday",
    "stime",
    "swapoff",
    "swapon",
    "sysfs",
    "umount",
    "umount2",
    "unshare",
    "uselib",
    "userfaultfd",
    "ustat",
    "vm86",
    "vm86old",
];

/// Extra syscalls refused by `strict` on top of [`DANGEROUS_SYSCALLS`].
const STRICT_EXTRA_SYSCALLS: &[&str] = &[
    "capset",
    "chroot",
    "fanotify_init",
    "mknod",
    "mknodat",
    "setdomainname",
    "setfsgid",
    "setfsuid",
    "setgid",
    "setgroups",
    "sethostname",
    "setregid",
    "setresgid",
    "setresuid",
    "setreuid",
    "setuid",
    "syslog",
    "vhangup",
];

/// The only syscalls `minimal` permits.
const MINIMAL_SYSCALLS: &[&str] = &[
    "access",
    "arch_prctl",
    "brk",
    "chdir",
    "clock_gettime",
    "clone",
    "close",
    "dup",
    "dup2",
    "execve",
    "exit",
    "exit_group",
    "fcntl",
    "fork",
    "fstat",
    "futex",
    "getcwd",
    "getdents64",
    "getegid",
    "geteuid",
    "getgid",
    "getpid",
    "getppid",
    "getrandom",
    "getuid",
    "ioctl",
    "kill",
    "lseek",
    "lstat",
    "mmap",
    "mprotect",
    "munmap",
    "nanosleep",
    "newfstatat",
    "open",
    "openat",
    "pipe",
    "poll",
    "pread64",
    "prlimit64",
    "read",
    "readlink",
    "rseq",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "select",
    "set_robust_list",
    "set_tid_address",
    "stat",
    "uname",
    "vfork",
    "wait4",
    "write",
];

/// Action taken when a syscall matches (or, as `defaultAction`, matches nothing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeccompAction {
    #[serde(rename = "SCMP_ACT_ALLOW")]
    Allow,
    #[serde(rename = "SCMP_ACT_ERRNO")]
    Errno,
    #[serde(rename = "SCMP_ACT_KILL")]
    Kill,
    #[serde(rename = "SCMP_ACT_TRAP")]
    Trap,
    #[serde(rename = "SCMP_ACT_TRACE")]
    Trace,
}

/// A group of syscalls sharing one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRule {
    pub names: BTreeSet<String>,
    pub action: SeccompAction,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub includes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub excludes: BTreeMap<String, serde_json::Value>,
}

impl SyscallRule {
    pub fn new<'a>(
        names: impl IntoIterator<Item = &'a str>,
        action: SeccompAction,
        comment: &str,
    ) -> Self {
        Self {
            names: names.into_iter().map(String::from).collect(),
            action,
            args: Vec::new(),
            comment: Some(comment.to_string()),
            includes: BTreeMap::new(),
            excludes: BTreeMap::new(),
        }
    }
}

/// A complete profile: default action, target architectures, rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeccompProfile {
    pub default_action: SeccompAction,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub syscalls: Vec<SyscallRule>,
}

fn default_architectures() -> Vec<String> {
    vec![
        "SCMP_ARCH_X86_64".to_string(),
        "SCMP_ARCH_X86".to_string(),
        "SCMP_ARCH_X32".to_string(),
    ]
}

impl SeccompProfile {
    /// Denylist layered as an `ERRNO` rule group.
    pub fn default_profile() -> Self {
        Self {
            default_action: SeccompAction::Errno,
            architectures: default_architectures(),
            syscalls: vec![SyscallRule::new(
                DANGEROUS_SYSCALLS.iter().copied(),
                SeccompAction::Errno,
                "Block dangerous syscalls",
            )],
        }
    }

    pub fn strict_profile() -> Self {
        Self {
            default_action: SeccompAction::Errno,
            architectures: default_architectures(),
            syscalls: vec![SyscallRule::new(
                DANGEROUS_SYSCALLS
                    .iter()
                    .chain(STRICT_EXTRA_SYSCALLS)
                    .copied(),
                SeccompAction::Errno,
                "Block dangerous and privilege-changing syscalls",
            )],
        }
    }

    pub fn minimal_profile() -> Self {
        Self {
            default_action: SeccompAction::Errno,
            architectures: default_architectures(),
            syscalls: vec![SyscallRule::new(
                MINIMAL_SYSCALLS.iter().copied(),
                SeccompAction::Allow,
                "Minimal syscall allowlist",
            )],
        }
    }

    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default_profile()),
            "strict" => Some(Self::strict_profile()),
            "minimal" => Some(Self::minimal_profile()),
            _ => None,
        }
    }

    fn names_with(&self, action: SeccompAction) -> BTreeSet<String> {
        self.syscalls
            .iter()
            .filter(|r| r.action == action)
            .flat_map(|r| r.names.iter().cloned())
            .collect()
    }

    /// Syscalls named by an `ERRNO`, `KILL` or `TRAP` rule.
    pub fn denied_syscalls(&self) -> BTreeSet<String> {
        let mut denied = self.names_with(SeccompAction::Errno);
        denied.extend(self.names_with(SeccompAction::Kill));
        denied.extend(self.names_with(SeccompAction::Trap));
        denied
    }

    /// Syscalls named by an `ALLOW` rule.
    pub fn allowed_syscalls(&self) -> BTreeSet<String> {
        self.names_with(SeccompAction::Allow)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the profile as pretty JSON, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        debug!(path = %path.display(), "seccomp profile written");
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// Resolves profile names to cached, immutable profiles.
pub struct SeccompRegistry {
    profile_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Arc<SeccompProfile>>>,
}

impl SeccompRegistry {
    pub fn new(profile_dir: Option<PathBuf>) -> Self {
        Self {
            profile_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn profile_dir(&self) -> Option<&Path> {
        self.profile_dir.as_deref()
    }

    /// Resolve `name`: cache, then built-ins, then `<profile_dir>/<name>.json`.
    pub fn get_profile(&self, name: &str) -> Result<Arc<SeccompProfile>> {
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Ok(hit.clone());
        }

        let profile = match SeccompProfile::builtin(name) {
            Some(p) => p,
            None => self.load_custom(name)?,
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(profile));
        Ok(entry.clone())
    }

    fn load_custom(&self, name: &str) -> Result<SeccompProfile> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        let Some(ref dir) = self.profile_dir else {
            return Err(Error::ProfileNotFound(name.to_string()));
        };
        let path = dir.join(format!("{}.json", name));
        if !path.is_file() {
            return Err(Error::ProfileNotFound(name.to_string()));
        }
        let profile = SeccompProfile::load_from(&path)?;
        info!(profile = name, path = %path.display(), "loaded custom seccomp profile");
        Ok(profile)
    }

    /// Built-in names followed by any `*.json` files in the profile dir.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_PROFILES.iter().map(|s| s.to_string()).collect();
        if let Some(ref dir) = self.profile_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                let mut custom: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .filter(|n| !BUILTIN_PROFILES.contains(&n.as_str()))
                    .collect();
                custom.sort();
                names.extend(custom);
            }
        }
        names
    }
}

impl Default for SeccompRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod bpf {
    use std::collections::BTreeMap;
    use std::convert::TryInto;

    use tracing::{info, warn};

    use super::{SeccompAction, SeccompProfile};
    use crate::{Error, Result};

    const SYSCALL_TABLE: &[(&str, i64)] = &[
        ("access", libc::SYS_access),
        ("acct", libc::SYS_acct),
        ("add_key", libc::SYS_add_key),
        ("arch_prctl", libc::SYS_arch_prctl),
        ("bpf", libc::SYS_bpf),
        ("brk", libc::SYS_brk),
        ("capset", libc::SYS_capset),
        ("chdir", libc::SYS_chdir),
        ("chroot", libc::SYS_chroot),
        ("clock_adjtime", libc::SYS_clock_adjtime),
        ("clock_gettime", libc::SYS_clock_gettime),
        ("clock_settime", libc::SYS_clock_settime),
        ("clone", libc::SYS_clone),
        ("close", libc::SYS_close),
        ("delete_module", libc::SYS_delete_module),
        ("dup", libc::SYS_dup),
        ("dup2", libc::SYS_dup2),
        ("execve", libc::SYS_execve),
        ("exit", libc::SYS_exit),
        ("exit_group", libc::SYS_exit_group),
        ("fanotify_init", libc::SYS_fanotify_init),
        ("fcntl", libc::SYS_fcntl),
        ("finit_module", libc::SYS_finit_module),
        ("fork", libc::SYS_fork),
        ("fstat", libc::SYS_fstat),
        ("futex", libc::SYS_futex),
        ("get_mempolicy", libc::SYS_get_mempolicy),
        ("getcwd", libc::SYS_getcwd),
        ("getdents64", libc::SYS_getdents64),
        ("getegid", libc::SYS_getegid),
        ("geteuid", libc::SYS_geteuid),
        ("getgid", libc::SYS_getgid),
        ("getpid", libc::SYS_getpid),
        ("getppid", libc::SYS_getppid),
        ("getrandom", libc::SYS_getrandom),
        ("getuid", libc::SYS_getuid),
        ("init_module", libc::SYS_init_module),
        ("ioctl", libc::SYS_ioctl),
        ("ioperm", libc::SYS_ioperm),
        ("iopl", libc::SYS_iopl),
        ("kcmp", libc::SYS_kcmp),
        ("kexec_file_load", libc::SYS_kexec_file_load),
        ("kexec_load", libc::SYS_kexec_load),
        ("keyctl", libc::SYS_keyctl),
        ("kill", libc::SYS_kill),
        ("lookup_dcookie", libc::SYS_lookup_dcookie),
        ("lseek", libc::SYS_lseek),
        ("lstat", libc::SYS_lstat),
        ("mbind", libc::SYS_mbind),
        ("mknod", libc::SYS_mknod),
        ("mknodat", libc::SYS_mknodat),
        ("mmap", libc::SYS_mmap),
        ("mount", libc::SYS_mount),
        ("move_pages", libc::SYS_move_pages),
        ("mprotect", libc::SYS_mprotect),
        ("munmap", libc::SYS_munmap),
        ("name_to_handle_at", libc::SYS_name_to_handle_at),
        ("nanosleep", libc::SYS_nanosleep),
        ("newfstatat", libc::SYS_newfstatat),
        ("open", libc::SYS_open),
        ("open_by_handle_at", libc::SYS_open_by_handle_at),
        ("openat", libc::SYS_openat),
        ("perf_event_open", libc::SYS_perf_event_open),
        ("personality", libc::SYS_personality),
        ("pipe", libc::SYS_pipe),
        ("pivot_root", libc::SYS_pivot_root),
        ("poll", libc::SYS_poll),
        ("pread64", libc::SYS_pread64),
        ("prlimit64", libc::SYS_prlimit64),
        ("process_vm_readv", libc::SYS_process_vm_readv),
        ("process_vm_writev", libc::SYS_process_vm_writev),
        ("ptrace", libc::SYS_ptrace),
        ("quotactl", libc::SYS_quotactl),
        ("read", libc::SYS_read),
        ("readlink", libc::SYS_readlink),
        ("reboot", libc::SYS_reboot),
        ("request_key", libc::SYS_request_key),
        ("rseq", libc::SYS_rseq),
        ("rt_sigaction", libc::SYS_rt_sigaction),
        ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
        ("rt_sigreturn", libc::SYS_rt_sigreturn),
        ("select", libc::SYS_select),
        ("set_mempolicy", libc::SYS_set_mempolicy),
        ("set_robust_list", libc::SYS_set_robust_list),
        ("set_tid_address", libc::SYS_set_tid_address),
        ("setdomainname", libc::SYS_setdomainname),
        ("setfsgid", libc::SYS_setfsgid),
        ("setfsuid", libc::SYS_setfsuid),
        ("setgid", libc::SYS_setgid),
        ("setgroups", libc::SYS_setgroups),
        ("sethostname", libc::SYS_sethostname),
        ("setns", libc::SYS_setns),
        ("setregid", libc::SYS_setregid),
        ("setresgid", libc::SYS_setresgid),
        ("setresuid", libc::SYS_setresuid),
        ("setreuid", libc::SYS_setreuid),
        ("settimeofday", libc::SYS_settimeofday),
        ("setuid", libc::SYS_setuid),
        ("stat", libc::SYS_stat),
        ("swapoff", libc::SYS_swapoff),
        ("swapon", libc::SYS_swapon),
        ("sysfs", libc::SYS_sysfs),
        ("syslog", libc::SYS_syslog),
        ("umount2", libc::SYS_umount2),
        ("uname", libc::SYS_uname),
        ("unshare", libc::SYS_unshare),
        ("uselib", libc::SYS_uselib),
        ("userfaultfd", libc::SYS_userfaultfd),
        ("ustat", libc::SYS_ustat),
        ("vfork", libc::SYS_vfork),
        ("vhangup", libc::SYS_vhangup),
        ("wait4", libc::SYS_wait4),
        ("write", libc::SYS_write),
    ];

    fn syscall_number(name: &str) -> Option<i64> {
        SYSCALL_TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, nr)| *nr)
    }

    fn to_seccompiler(action: SeccompAction) -> seccompiler::SeccompAction {
        match action {
            SeccompAction::Allow => seccompiler::SeccompAction::Allow,
            SeccompAction::Errno => seccompiler::SeccompAction::Errno(libc::EPERM as u32),
            SeccompAction::Kill => seccompiler::SeccompAction::KillProcess,
            SeccompAction::Trap => seccompiler::SeccompAction::Trap,
            SeccompAction::Trace => seccompiler::SeccompAction::Trace(0),
        }
    }

    impl SeccompProfile {
        /// Compile to a BPF program for the host architecture.
        ///
        /// Rules whose action equals the default action are no-ops and are
        /// dropped; the remaining rules must agree on a single action. Syscall
        /// names unknown on this architecture are skipped.
        pub fn compile(&self) -> Result<seccompiler::BpfProgram> {
            let mut match_action = None;
            let mut rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = BTreeMap::new();

            for rule in self
                .syscalls
                .iter()
                .filter(|r| r.action != self.default_action)
            {
                match match_action {
                    None => match_action = Some(rule.action),
                    Some(existing) if existing != rule.action => {
                        return Err(Error::Seccomp(format!(
                            "rules mix {:?} and {:?}; only one non-default action is supported",
                            existing, rule.action
                        )));
                    }
                    Some(_) => {}
                }
                for name in &rule.names {
                    match syscall_number(name) {
                        Some(nr) => {
                            rules.insert(nr, Vec::new());
                        }
                        None => warn!(syscall = %name, "unknown syscall skipped"),
                    }
                }
            }

            let Some(match_action) = match_action else {
                return Err(Error::Seccomp(format!(
                    "no rule differs from the default action {:?}; the filter would be a no-op",
                    self.default_action
                )));
            };

            let filter = seccompiler::SeccompFilter::new(
                rules,
                to_seccompiler(self.default_action),
                to_seccompiler(match_action),
                std::env::consts::ARCH
                    .try_into()
                    .map_err(|_| Error::Seccomp("Unsupported architecture for seccomp".into()))?,
            )
            .map_err(|e| Error::Seccomp(format!("Failed to create seccomp filter: {:?}", e)))?;

            let program: seccompiler::BpfProgram = filter
                .try_into()
                .map_err(|e| Error::Seccomp(format!("Failed to compile seccomp filter: {:?}", e)))?;
            Ok(program)
        }

        /// Compile and install on the calling thread. Irreversible.
        pub fn apply(&self) -> Result<()> {
            let program = self.compile()?;
            seccompiler::apply_filter(&program)
                .map_err(|e| Error::Seccomp(format!("Failed to apply seccomp filter: {:?}", e)))?;
            info!(instructions = program.len(), "Seccomp-BPF filter installed");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_minimal_compiles() {
            let program = SeccompProfile::minimal_profile().compile().unwrap();
            assert!(!program.is_empty());
        }

        #[test]
        fn test_default_profile_rejected_by_compiler() {
            let err = SeccompProfile::default_profile().compile().unwrap_err();
            assert!(matches!(err, Error::Seccomp(_)));
        }

        #[test]
        fn test_all_builtin_names_known() {
            for name in super::super::MINIMAL_SYSCALLS {
                assert!(syscall_number(name).is_some(), "{} missing", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_superset_of_default() {
        let default = SeccompProfile::default_profile().denied_syscalls();
        let strict = SeccompProfile::strict_profile().denied_syscalls();
        assert!(strict.is_superset(&default));
        assert!(strict.len() > default.len());
        assert!(strict.contains("setuid"));
        assert!(!default.contains("setuid"));
    }

    #[test]
    fn test_minimal_allowlist() {
        let minimal = SeccompProfile::minimal_profile();
        let allowed = minimal.allowed_syscalls();
        for name in ["read", "write", "open", "close", "execve", "exit"] {
            assert!(allowed.contains(name), "{} not allowed", name);
        }
        assert_eq!(minimal.default_action, SeccompAction::Errno);
        assert!(minimal.denied_syscalls().is_empty());
    }

    #[test]
    fn test_json_shape() {
        let json = SeccompProfile::default_profile().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["defaultAction"], "SCMP_ACT_ERRNO");
        assert_eq!(value["syscalls"][0]["action"], "SCMP_ACT_ERRNO");
        assert!(value["syscalls"][0]["names"]
            .as_array()
            .unwrap()
            .iter()
            .any(|n| n == "ptrace"));
        assert!(value["syscalls"][0]["args"].as_array().unwrap().is_empty());
        assert!(value["syscalls"][0]["includes"].is_object());
        assert!(value["architectures"].is_array());
    }

    #[test]
    fn test_registry_caches() {
        let registry = SeccompRegistry::default();
        let a = registry.get_profile("strict").unwrap();
        let b = registry.get_profile("strict").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_unknown_profile() {
        let registry = SeccompRegistry::default();
        assert!(matches!(
            registry.get_profile("nope"),
            Err(Error::ProfileNotFound(_))
        ));
        assert!(matches!(
            registry.get_profile("../etc/passwd"),
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[test]
    fn test_registry_custom_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut custom = SeccompProfile::minimal_profile();
        custom.syscalls[0].names.insert("socket".into());
        custom.write_to(&dir.path().join("net.json")).unwrap();

        let registry = SeccompRegistry::new(Some(dir.path().to_path_buf()));
        let loaded = registry.get_profile("net").unwrap();
        assert!(loaded.allowed_syscalls().contains("socket"));
        assert_eq!(*loaded, custom);
        assert_eq!(registry.available(), vec!["default", "strict", "minimal", "net"]);
    }
}
