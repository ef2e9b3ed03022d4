use crate::app::Application;
use anyhow::Context;
use clap::Parser;
use portico_repo::Repository;
use portico_server_common::{config::DEFAULT_CONFIG_FILE, Config, DiagnosticFormat, LoggingConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Content-connector daemon for a search appliance.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Opt {
    /// Configuration file to load. Defaults to
    /// `adaptor-config.properties` in the working directory when that
    /// file exists.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Individual configuration overrides, strongest layer:
    /// `-D key=value`. May be given multiple times.
    #[arg(short = 'D', value_name = "KEY=VALUE", value_parser = parse_key_value)]
    define: Vec<(String, String)>,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are
    /// intended for human consumption; json outputs machine readable
    /// records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) => Ok((key.trim().to_string(), value.to_string())),
        None => Err(format!("{raw:?} is not KEY=VALUE")),
    }
}

impl Opt {
    fn overrides(&self) -> BTreeMap<String, String> {
        self.define.iter().cloned().collect()
    }

    /// The config file: `--config`, else `-D adaptor.configfile=`,
    /// else the default name when present on disk.
    fn config_file(&self, overrides: &BTreeMap<String, String>) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        if let Some(path) = overrides.get("adaptor.configfile") {
            return Some(PathBuf::from(path));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }
}

/// Full command-line entry point for an adaptor binary:
///
/// ```no_run
/// # use std::sync::Arc;
/// # async fn example(repo: Arc<dyn portico_repo::Repository>) -> anyhow::Result<std::process::ExitCode> {
/// portico_server::cli::run_adaptor(repo).await
/// # }
/// ```
pub async fn run_adaptor(repo: Arc<dyn Repository>) -> anyhow::Result<ExitCode> {
    let opt = Opt::parse();
    LoggingConfig {
        log_dir: opt.diag_log_dir.clone(),
        diag_format: opt.diag_format,
        filter_env_var: "PORTICOD_LOG",
        default_filter: "portico_server=info,portico_server_common=info,portico_feed=info",
    }
    .init()?;

    let overrides = opt.overrides();
    let config = Config::load(opt.config_file(&overrides).as_deref(), &overrides)
        .context("loading configuration")?;
    let code = Application::run(config, repo).await?;
    Ok(ExitCode::from(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_parse_and_layer() {
        let opt = Opt::parse_from([
            "porticod",
            "-D",
            "gsa.hostname=gsa.example.com",
            "-D",
            "feed.name=files",
        ]);
        let overrides = opt.overrides();
        assert_eq!(
            overrides.get("gsa.hostname").map(String::as_str),
            Some("gsa.example.com")
        );
        assert_eq!(overrides.get("feed.name").map(String::as_str), Some("files"));
    }

    #[test]
    fn configfile_override_key_is_honored() {
        let opt = Opt::parse_from(["porticod", "-D", "adaptor.configfile=/etc/portico.properties"]);
        let overrides = opt.overrides();
        assert_eq!(
            opt.config_file(&overrides),
            Some(PathBuf::from("/etc/portico.properties"))
        );

        let opt = Opt::parse_from(["porticod", "--config", "/tmp/x.properties"]);
        assert_eq!(
            opt.config_file(&BTreeMap::new()),
            Some(PathBuf::from("/tmp/x.properties"))
        );
    }

    #[test]
    fn bad_define_is_rejected() {
        assert!(Opt::try_parse_from(["porticod", "-D", "no-equals"]).is_err());
    }
}
