use std::process::ExitCode;

use clap::Parser;

use cnc_lib::cli::Cli;
use cnc_lib::config::Config;
use cnc_lib::engine::{self, DriverRegistry, LogTarget, EXIT_NO_JOBS, EXIT_STARTUP_FAILED, EXIT_SUCCESS};
use cnc_lib::notify::NotificationTrigger;
use cnc_lib::util::paths;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let mut config = match Config::load_or_init(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        log::error!("{e}");
        return ExitCode::from(EXIT_STARTUP_FAILED);
    }

    let registry = DriverRegistry::with_builtin_backends();
    log::debug!("Registered backends: {registry:?}");

    if cli.dry_run {
        log::warn!("Running in dry-run mode");
        let table = engine::materialize_jobs(&config, &registry, &LogTarget::Memory);
        for job in table.jobs() {
            log::info!(
                "Job {}: {} `{}` -> `{}`{}",
                job.id(),
                job.backend(),
                job.origin(),
                job.target(),
                if job.wants_email() { " (digest)" } else { "" }
            );
        }
        for warning in table.warnings() {
            log::warn!("{warning}");
        }
        let code = if table.is_empty() { EXIT_NO_JOBS } else { EXIT_SUCCESS };
        return ExitCode::from(code);
    }

    let log_dir = match paths::resolve_log_directory(config.log.directory.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(EXIT_STARTUP_FAILED);
        }
    };
    log::info!("Writing job logs to {}", log_dir.display());

    let trigger = NotificationTrigger::smtp(config.smtp.as_ref(), None);
    if trigger.is_enabled() {
        log::debug!("Mail digests are enabled");
    }

    let summary = engine::run(&config, &registry, &LogTarget::Directory(log_dir), &trigger);
    summary.log();

    ExitCode::from(summary.exit_code())
}
