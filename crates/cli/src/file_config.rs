//! Optional TOML file with defaults for `tty-runner run`.
//!
//! ```toml
//! path_to_makefile = "fs/nilfs-dedup"
//! command_list_setup = "tests/setup.txt"
//! command_list = "tests/dedup.txt"
//! output_file = "dedup_output.txt"
//! marker = "Starting network: OK"
//! poll_interval_ms = 500
//! injection = "master"
//! ```
//!
//! Relative paths are resolved against the directory of the file. Flags given
//! on the command line win over anything set here.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ttyrun::{BuildTool, InjectionMode};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub path_to_makefile: Option<PathBuf>,
    /// Explicit build tool, used instead of `make -C <path_to_makefile> vm-tty`.
    pub build_tool: Option<BuildTool>,
    pub command_list_setup: Option<PathBuf>,
    pub command_list: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub show_output: Option<bool>,
    pub marker: Option<String>,
    pub reboot_command: Option<String>,
    pub boot_settle_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub shutdown_grace_secs: Option<u64>,
    pub injection: Option<InjectionMode>,
    pub no_chown: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&text)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.path_to_makefile,
            &mut self.command_list_setup,
            &mut self.command_list,
            &mut self.output_file,
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
