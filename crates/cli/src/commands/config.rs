// `annosync config` — show or create `~/.annosync/config.toml`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Args, Subcommand};
use serde::Serialize;

use annosync_client::config::{global_config_path, ClientConfig};

use crate::exit_code::UsageError;
use crate::output::{self, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show(ShowArgs),
    /// Write a new configuration file
    Init(InitArgs),
}

impl ConfigCommand {
    pub fn json_requested(&self) -> bool {
        match self {
            Self::Show(args) => args.json,
            Self::Init(args) => args.json,
        }
    }
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Config file (defaults to ~/.annosync/config.toml).
    #[arg(long, value_name = "PATH")]
    path: Option<PathBuf>,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Config file (defaults to ~/.annosync/config.toml).
    #[arg(long, value_name = "PATH")]
    path: Option<PathBuf>,
    #[arg(long)]
    endpoint_url: Option<String>,
    #[arg(long)]
    subscription_url: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long, value_name = "PATH")]
    index_path: Option<PathBuf>,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowResult {
    pub path: String,
    pub exists: bool,
    pub config: ClientConfig,
    pub index_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub path: String,
    pub config: ClientConfig,
}

pub fn run(cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show(args) => {
            let format = OutputFormat::detect(args.json);
            let path = resolve_config_path(args.path)?;
            let result = show(&path)?;
            if !result.exists {
                output::print_warning(
                    format,
                    "CONFIG_MISSING",
                    &format!("no config file at {}; showing defaults", result.path),
                );
            }
            output::print_output(format, &result, format_show_human)?;
        }
        ConfigCommand::Init(args) => {
            let format = OutputFormat::detect(args.json);
            let path = resolve_config_path(args.path.clone())?;
            let config = ClientConfig {
                endpoint_url: args.endpoint_url,
                subscription_url: args.subscription_url,
                index_path: args.index_path,
                display_name: args.display_name,
            };
            let result = init(&path, config, args.force)?;
            output::print_output(format, &result, |r| format!("Wrote {}", r.path))?;
        }
    }
    Ok(())
}

fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    flag.or_else(global_config_path)
        .ok_or_else(|| anyhow!("could not determine home directory; pass --path"))
}

fn show(path: &Path) -> anyhow::Result<ShowResult> {
    let exists = path.exists();
    let config = if exists {
        ClientConfig::load_from(path)
            .with_context(|| format!("failed to read config at `{}`", path.display()))?
    } else {
        ClientConfig::default()
    };
    let index_path = config.resolved_index_path().map(|p| p.display().to_string());

    Ok(ShowResult { path: path.display().to_string(), exists, config, index_path })
}

fn init(path: &Path, config: ClientConfig, force: bool) -> anyhow::Result<InitResult> {
    if path.exists() && !force {
        return Err(UsageError(format!(
            "config already exists at `{}`; pass --force to overwrite",
            path.display()
        ))
        .into());
    }
    config
        .save_to(path)
        .with_context(|| format!("failed to write config to `{}`", path.display()))?;

    Ok(InitResult { path: path.display().to_string(), config })
}

fn format_show_human(result: &ShowResult) -> String {
    let unset = "(unset)";
    let mut lines = vec![format!("Config: {}", result.path)];
    lines.push(format!(
        "  endpoint_url:     {}",
        result.config.endpoint_url.as_deref().unwrap_or(unset)
    ));
    lines.push(format!(
        "  subscription_url: {}",
        result.config.subscription_url.as_deref().unwrap_or(unset)
    ));
    lines.push(format!(
        "  display_name:     {}",
        result.config.display_name.as_deref().unwrap_or(unset)
    ));
    lines.push(format!("  index_path:       {}", result.index_path.as_deref().unwrap_or(unset)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use annosync_client::config::ConfigError;
    use tempfile::TempDir;

    fn sample() -> ClientConfig {
        ClientConfig {
            endpoint_url: Some("https://annotations.example.com/api".into()),
            subscription_url: Some("wss://annotations.example.com/feed".into()),
            index_path: Some(PathBuf::from("/var/lib/annosync/index.db")),
            display_name: Some("ann".into()),
        }
    }

    #[test]
    fn init_then_show_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        init(&path, sample(), false).unwrap();
        let shown = show(&path).unwrap();

        assert!(shown.exists);
        assert_eq!(shown.config, sample());
        assert_eq!(shown.index_path.as_deref(), Some("/var/lib/annosync/index.db"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, sample(), false).unwrap();

        let error = init(&path, ClientConfig::default(), false).unwrap_err();
        assert!(error.to_string().contains("already exists"));

        init(&path, ClientConfig::default(), true).unwrap();
        assert_eq!(show(&path).unwrap().config, ClientConfig::default());
    }

    #[test]
    fn init_rejects_plaintext_remote_endpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = ClientConfig {
            endpoint_url: Some("http://annotations.example.com/api".into()),
            ..ClientConfig::default()
        };

        let error = init(&path, config, false).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidUrl { field: "endpoint_url", .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn show_missing_file_reports_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let shown = show(&path).unwrap();
        assert!(!shown.exists);
        assert_eq!(shown.config, ClientConfig::default());
    }

    #[test]
    fn human_show_marks_unset_fields() {
        let result = ShowResult {
            path: "/home/ann/.annosync/config.toml".into(),
            exists: true,
            config: ClientConfig { display_name: Some("ann".into()), ..ClientConfig::default() },
            index_path: None,
        };
        let output = format_show_human(&result);

        assert!(output.starts_with("Config: /home/ann/.annosync/config.toml"));
        assert!(output.contains("endpoint_url:     (unset)"));
        assert!(output.contains("display_name:     ann"));
    }
}
