//! Remote command rendering.
//!
//! Programs are symbolic (`rake`, `bundle`) and resolved through a
//! [`CommandMap`] at render time, so `rake` can become `bundle exec rake`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CommandMap {
    entries: BTreeMap<String, String>,
}

impl CommandMap {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn resolve<'a>(&'a self, program: &'a str) -> &'a str {
        self.entries.get(program).map(String::as_str).unwrap_or(program)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    within: Option<PathBuf>,
    env: Vec<(String, String)>,
    pipe: Option<Box<RemoteCommand>>,
    append_to: Option<PathBuf>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            within: None,
            env: Vec::new(),
            pipe: None,
            append_to: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let rendered = path.as_ref().display().to_string();
        self.arg(rendered)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Run from `dir` on the remote side.
    pub fn within(mut self, dir: impl AsRef<Path>) -> Self {
        self.within = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed this command's stdout into `next`.
    pub fn pipe(mut self, next: RemoteCommand) -> Self {
        self.pipe = Some(Box::new(next));
        self
    }

    pub fn append_to(mut self, path: impl AsRef<Path>) -> Self {
        self.append_to = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render the full shell line sent to the host.
    pub fn render(&self, map: &CommandMap) -> String {
        let mut line = self.render_pipeline(map);

        if let Some(target) = &self.append_to {
            line = format!("{line} >> {}", shell_quote(&target.display().to_string()));
        }

        if !self.env.is_empty() {
            let exports: Vec<String> = self
                .env
                .iter()
                .map(|(k, v)| format!("export {k}={}", shell_quote(v)))
                .collect();
            line = format!("( {} ; {line} )", exports.join(" "));
        }

        match &self.within {
            Some(dir) => format!("cd {} && {line}", shell_quote(&dir.display().to_string())),
            None => line,
        }
    }

    fn render_pipeline(&self, map: &CommandMap) -> String {
        let mut parts = vec![map.resolve(&self.program).to_string()];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let head = parts.join(" ");
        match &self.pipe {
            Some(next) => format!("{head} | {}", next.render_pipeline(map)),
            None => head,
        }
    }
}

/// POSIX single-quote escaping; leaves obviously safe words untouched.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
