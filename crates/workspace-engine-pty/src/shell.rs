//! Shell selection inside a container.
//!
//! The container's shells are unknown ahead of time, so the interactive
//! argv is a small `sh` script that execs the first preferred shell that
//! exists, falling back to `sh`.

/// Known container shells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerShell {
    Zsh,
    Bash,
    Sh,
    Other(String),
}

impl ContainerShell {
    /// Classify a shell by name or path.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.rsplit('/').next().unwrap_or(name) {
            "zsh" => Self::Zsh,
            "bash" => Self::Bash,
            "sh" => Self::Sh,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Program name or path to exec.
    #[must_use]
    pub fn program(&self) -> &str {
        match self {
            Self::Zsh => "zsh",
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::Other(name) => name,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh | Self::Bash)
    }

    fn exec_line(&self) -> Option<String> {
        let program = shlex::try_quote(self.program()).ok()?;
        let flag = if self.login() { " -l" } else { "" };
        Some(format!(
            "if command -v {program} >/dev/null 2>&1; then exec {program}{flag}; fi"
        ))
    }
}

/// Argv that starts the first available shell from `preferences`.
#[must_use]
pub fn interactive_argv(preferences: &[String]) -> Vec<String> {
    let mut script: Vec<String> = preferences
        .iter()
        .map(|name| ContainerShell::from_name(name.trim()))
        .filter(|shell| !shell.program().is_empty())
        .filter_map(|shell| shell.exec_line())
        .collect();
    script.push("exec sh".to_string());
    vec!["sh".to_string(), "-c".to_string(), script.join("; ")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(ContainerShell::from_name("/usr/bin/zsh"), ContainerShell::Zsh);
        assert_eq!(ContainerShell::from_name("bash"), ContainerShell::Bash);
        assert_eq!(
            ContainerShell::from_name("/bin/fish"),
            ContainerShell::Other("/bin/fish".to_string())
        );
        assert!(ContainerShell::Bash.login());
        assert!(!ContainerShell::Sh.login());
    }

    #[test]
    fn test_interactive_argv_prefers_in_order() {
        let argv = interactive_argv(&["bash".to_string(), "sh".to_string()]);
        assert_eq!(argv[..2], ["sh", "-c"]);
        assert_eq!(
            argv[2],
            "if command -v bash >/dev/null 2>&1; then exec bash -l; fi; \
             if command -v sh >/dev/null 2>&1; then exec sh; fi; exec sh"
        );
    }

    #[tokio::test]
    async fn test_interactive_argv_falls_back_to_sh() {
        let mut argv = interactive_argv(&["wse-no-such-shell".to_string(), String::new()]);
        // Make the fallback observable without a terminal.
        argv[2] = argv[2].replace("exec sh", "exec sh -c 'echo fallback'");
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "fallback\n");
    }
}
