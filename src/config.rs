use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../config/default.yaml");
pub const DEFAULT_SIGNATURES_TEMPLATE: &str = include_str!("../config/signatures.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default)]
    pub ebpf_object: Option<String>,
    #[serde(default = "default_signature_file")]
    pub signature_file: String,
    #[serde(default = "default_syscall_table_paths")]
    pub syscall_table_paths: Vec<String>,
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub show_other: bool,
}

/// One ordered classification rule: a syscall whose name starts with any of
/// the prefixes belongs to this category. `visible` is only the default for
/// the advisory display filter, never a detection input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            ebpf_object: None,
            signature_file: default_signature_file(),
            syscall_table_paths: default_syscall_table_paths(),
            categories: default_categories(),
            show_other: false,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        if !config_path.exists() {
            if explicit {
                warn!(
                    path = %config_path.display(),
                    "config file not found; using built-in defaults (run `vitals init` to create one)"
                );
            }
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;
        let mut cfg = Self::from_yaml_str(&raw).map_err(|err| {
            anyhow!("invalid YAML in config file {}: {err}", config_path.display())
        })?;

        cfg.signature_file = expand_tilde(&cfg.signature_file);
        if let Some(object) = cfg.ebpf_object.take() {
            cfg.ebpf_object = Some(expand_tilde(&object));
        }
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    /// Default advisory visibility per category name, fallback included.
    pub fn default_visibility(&self) -> Vec<(String, bool)> {
        let mut out: Vec<(String, bool)> = self
            .categories
            .iter()
            .map(|rule| (rule.name.clone(), rule.visible))
            .collect();
        out.push(("other".to_string(), self.show_other));
        out
    }
}

fn default_sensitivity() -> f64 {
    1.0
}

fn default_visible() -> bool {
    true
}

fn default_signature_file() -> String {
    "~/.config/vitals/signatures.json".into()
}

fn default_syscall_table_paths() -> Vec<String> {
    vec![
        "/usr/include/x86_64-linux-gnu/asm/unistd_64.h".into(),
        "/usr/include/asm/unistd_64.h".into(),
    ]
}

fn category(name: &str, visible: bool, prefixes: &[&str]) -> CategoryRule {
    CategoryRule {
        name: name.to_string(),
        prefixes: prefixes.iter().map(ToString::to_string).collect(),
        visible,
    }
}

fn default_categories() -> Vec<CategoryRule> {
    vec![
        category(
            "file_io",
            true,
            &[
                "read", "write", "open", "close", "creat", "lseek", "pread", "pwrite",
                "sendfile", "splice", "copy_file_range", "fsync", "fdatasync", "truncate",
                "ftruncate", "fallocate", "dup",
            ],
        ),
        category(
            "fs_meta",
            true,
            &[
                "stat", "fstat", "lstat", "newfstatat", "statx", "access", "faccessat",
                "getdents", "mkdir", "rmdir", "rename", "link", "unlink", "symlink", "chmod",
                "fchmod", "chown", "fchown", "umask", "utime", "chdir", "fchdir", "getcwd",
                "mount", "umount",
            ],
        ),
        category(
            "process",
            true,
            &[
                "fork", "vfork", "clone", "execve", "exit", "wait", "kill", "tgkill",
                "getpid", "getppid", "gettid", "sched_", "prctl", "arch_prctl",
                "set_tid_address", "setpriority", "getpriority",
            ],
        ),
        category(
            "memory",
            false,
            &[
                "mmap", "munmap", "mremap", "mprotect", "brk", "madvise", "mlock", "munlock",
                "msync", "membarrier",
            ],
        ),
        category(
            "ipc",
            false,
            &[
                "pipe", "shmget", "shmat", "shmdt", "shmctl", "semget", "semop", "semctl",
                "msgget", "msgsnd", "msgrcv", "msgctl", "mq_", "eventfd", "signalfd",
                "memfd_create",
            ],
        ),
        category(
            "network",
            true,
            &[
                "socket", "connect", "accept", "bind", "listen", "send", "recv", "shutdown",
                "getsockname", "getpeername", "getsockopt", "setsockopt",
            ],
        ),
        category(
            "events",
            false,
            &[
                "poll", "ppoll", "select", "pselect", "epoll_", "io_uring_", "inotify_",
                "fanotify_", "timerfd_", "futex",
            ],
        ),
        category(
            "time",
            false,
            &[
                "time", "gettimeofday", "settimeofday", "clock_", "nanosleep", "alarm",
                "timer_", "adjtimex",
            ],
        ),
        category(
            "security",
            true,
            &[
                "capget", "capset", "ptrace", "seccomp", "setuid", "setgid", "setreuid",
                "setregid", "setresuid", "setresgid", "setgroups", "getuid", "geteuid",
                "getgid", "getegid", "landlock_", "keyctl", "add_key", "request_key",
            ],
        ),
    ]
}

pub fn default_config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config/vitals/config.yaml")
    } else {
        PathBuf::from("/etc/vitals/config.yaml")
    }
}

pub fn default_signatures_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config/vitals/signatures.json")
    } else {
        PathBuf::from("/etc/vitals/signatures.json")
    }
}

pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return format!("{home}/{rest}");
    }
    input.to_string()
}
