//! Provider command lines, rendered for `sh -c` inside a container.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Unbalanced quoting in provider binary: {0}")]
    InvalidBase(String),
    #[error("Provider command has no program")]
    EmptyCommand,
    #[error("Cannot quote word for sh: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// A program invocation plus the variables exported ahead of it.
#[derive(Debug, Clone)]
pub struct CommandParts {
    /// Variables exported before the program runs.
    pub exports: Vec<(String, String)>,
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Render as a single `sh` command line.
    ///
    /// # Errors
    /// Returns error if a word cannot be quoted (it contains a NUL byte).
    pub fn to_shell_line(&self) -> Result<String, CommandBuildError> {
        self.render(false)
    }

    /// Render with exported values masked, for logging.
    #[must_use]
    pub fn redacted(&self) -> String {
        self.render(true)
            .unwrap_or_else(|_| format!("{} <unquotable arguments>", self.program))
    }

    fn render(&self, redact: bool) -> Result<String, CommandBuildError> {
        let mut line = String::new();
        for (key, value) in &self.exports {
            let value = if redact {
                "***".into()
            } else {
                shlex::try_quote(value)?
            };
            line.push_str(&format!("export {key}={value}; "));
        }
        let words = std::iter::once(&self.program).chain(&self.args);
        let quoted = shlex::try_join(words.map(String::as_str))?;
        line.push_str(&quoted);
        Ok(line)
    }
}

/// Assembles a provider invocation from a configured binary line.
///
/// The binary line may carry its own words (`npx -y claude`); they are split
/// with shell rules before the fixed parameters are appended.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Configured binary line.
    pub base: String,
    /// Parameters appended after the binary words.
    pub params: Option<Vec<String>>,
    /// Variables exported ahead of the command.
    pub exports: Vec<(String, String)>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
            exports: Vec::new(),
        }
    }

    /// Replace the parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Append parameters, e.g. `--model` or configured extra arguments.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Export variables ahead of the command.
    ///
    /// Names that are not valid shell identifiers are skipped.
    #[must_use]
    pub fn exports<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if is_shell_identifier(&key) {
                self.exports.push((key, value));
            } else {
                tracing::warn!(%key, "Skipping export with invalid variable name");
            }
        }
        self
    }

    /// Command for a turn that starts a new provider session.
    ///
    /// # Errors
    /// Returns error if the binary line does not split or yields no program.
    pub fn build_initial(&self) -> Result<CommandParts, CommandBuildError> {
        self.build(&[])
    }

    /// Command for a turn that resumes a session; `resume_args` go last.
    ///
    /// # Errors
    /// Returns error if the binary line does not split or yields no program.
    pub fn build_follow_up(&self, resume_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        self.build(resume_args)
    }

    fn build(&self, trailing: &[String]) -> Result<CommandParts, CommandBuildError> {
        let words = shlex::split(&self.base)
            .ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        let mut words = words
            .into_iter()
            .chain(self.params.iter().flatten().cloned())
            .chain(trailing.iter().cloned());

        let program = words.next().ok_or(CommandBuildError::EmptyCommand)?;
        Ok(CommandParts {
            exports: self.exports.clone(),
            program,
            args: words.collect(),
        })
    }
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
