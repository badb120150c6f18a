use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ordered, non-empty list of shell lines to type into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandScript {
    lines: Vec<String>,
}

impl CommandScript {
    /// Creates a script from `lines`.
    ///
    /// An empty script could never trigger the output the run waits for, so
    /// it is rejected with [`Error::Configuration`].
    pub fn new<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return Err(Error::Configuration("command script is empty".into()));
        }
        if let Some(line) = lines.iter().find(|line| line.contains('\n')) {
            return Err(Error::Configuration(format!(
                "command contains an embedded newline: {line:?}"
            )));
        }
        Ok(Self { lines })
    }

    /// Parses one command per line. A trailing `\r` is stripped.
    pub fn parse(text: &str) -> Result<Self> {
        Self::new(text.lines().map(|line| line.trim_end_matches('\r')))
    }

    /// Appends `other` after this script (setup commands first).
    pub fn then(mut self, other: CommandScript) -> Self {
        self.lines.extend(other.lines);
        self
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl TryFrom<Vec<String>> for CommandScript {
    type Error = Error;

    fn try_from(lines: Vec<String>) -> Result<Self> {
        Self::new(lines)
    }
}

impl From<CommandScript> for Vec<String> {
    fn from(script: CommandScript) -> Self {
        script.lines
    }
}
