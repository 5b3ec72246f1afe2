use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use crate::config::Config;

/// Replicates databases from their origin to their target server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Location of the config file. A default config is written if it doesn't exist.
    #[arg(long, short = 'f', env = "CNC_CONFIG", default_value = "/etc/cnc/cnc.toml")]
    pub config_file: PathBuf,

    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Enable or disable mail digests, overriding `smtp.enabled`.
    #[arg(long, value_name = "BOOL")]
    pub email: Option<bool>,

    /// Directory of the per-job log files, overriding `log.directory`.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Maximum number of jobs of this run, overriding `engine.max_jobs`.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_jobs: Option<u16>,

    /// List the jobs that would run without connecting to any database.
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    /// Applies the command line overrides to `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(max_jobs) = self.max_jobs {
            config.engine.max_jobs = usize::from(max_jobs);
        }
        if let Some(dir) = &self.log_dir {
            config.log.directory = Some(dir.clone());
        }
        if let Some(email) = self.email {
            config.set_email_enabled(email);
        }
    }
}
