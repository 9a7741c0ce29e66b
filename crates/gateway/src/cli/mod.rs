//! Command-line surface for the `toolgate` binary.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use tg_domain::config::GatewayConfig;

#[derive(Parser)]
#[command(name = "toolgate", about = "Policy-enforcing gateway for tool-calling agents")]
pub struct Cli {
    /// Path to the configuration document (YAML or JSON).
    /// Falls back to `TG_CONFIG`, then `toolgate.yaml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Configuration inspection.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Parse and validate the configuration, then exit.
    Validate,
    /// Print the effective configuration with credentials redacted.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Resolve the config path (`--config`, then `TG_CONFIG`, then
/// `toolgate.yaml`), load and validate the document.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<(GatewayConfig, PathBuf)> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::var("TG_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("toolgate.yaml")),
    };
    if !path.exists() {
        anyhow::bail!("configuration file not found: {}", path.display());
    }
    let config = GatewayConfig::load(&path)
        .map_err(|e| anyhow::anyhow!("loading {}: {e}", path.display()))?;
    Ok((config, path))
}

/// Print the effective configuration as YAML, with credential keys and
/// token secrets replaced by a placeholder.
pub fn show(config: &GatewayConfig) {
    let mut redacted = config.clone();
    if let Some(auth) = redacted.auth.as_mut() {
        for credential in auth.credentials.iter_mut() {
            credential.key = "***".into();
        }
        if let Some(token) = auth.token.as_mut() {
            if token.secret.is_some() {
                token.secret = Some("***".into());
            }
        }
    }
    match serde_yaml::to_string(&redacted) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("could not render config: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_config_reads_yaml_from_explicit_path() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
auth:
  mode: none
audit:
  dbPath: ":memory:"
policies:
  - id: open
    roles: ["*"]
    rules:
      - action: allow
"#
        )
        .unwrap();
        let (config, path) = load_config(Some(file.path())).unwrap();
        assert_eq!(path, file.path());
        assert_eq!(config.policies[0].id, "open");
    }

    #[test]
    fn load_config_rejects_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/toolgate.yaml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn load_config_reports_validation_problems() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "auth:\n  mode: none\n").unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("policy"));
    }
}
