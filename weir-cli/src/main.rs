use std::{collections::HashMap, error::Error, path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod local_exec;
mod window_args;

use window_args::WindowArgs;

/// Weir CLI for running watermarked ETL jobs
#[derive(Debug, Parser)]
#[command(name = "weir", version, about, long_about = None)]
struct Args {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "WEIR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a job: open the audit record, extract, load and close
    ///
    /// e.g. weir run -f orders.yml 2026-01-01 mode=F30
    Run {
        /// Path to the job file
        #[arg(short, long)]
        file: PathBuf,

        /// k=v list of parameters to pass to the job file
        /// e.g. weir run -f file.yml -p key1=value1 -p key2=value2
        #[arg(short, long, value_parser = parse_key_val::<String, String>)]
        params: Option<Vec<(String, String)>>,

        #[command(flatten)]
        window: WindowArgs,

        /// Create the target schema and table when they do not exist
        #[arg(long)]
        create_target: bool,
    },

    /// Print the window the next run would load, without recording a run
    Window {
        /// Path to the job file
        #[arg(short, long)]
        file: PathBuf,

        /// k=v list of parameters to pass to the job file
        #[arg(short, long, value_parser = parse_key_val::<String, String>)]
        params: Option<Vec<(String, String)>>,

        #[command(flatten)]
        window: WindowArgs,
    },
}

fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

fn init_tracing(log_level: &str, json: bool) {
    let level = Level::from_str(log_level.to_lowercase().as_str()).unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json);

    match args.command {
        Commands::Run {
            file,
            params,
            window,
            create_target,
        } => {
            let params = HashMap::from_iter(params.unwrap_or_default());
            local_exec::run(file, params, window.to_override()?, create_target)
        }
        Commands::Window {
            file,
            params,
            window,
        } => {
            let params = HashMap::from_iter(params.unwrap_or_default());
            local_exec::preview(file, params, window.to_override()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let args = Args::try_parse_from([
            "weir",
            "run",
            "-f",
            "orders.yml",
            "-p",
            "schema=sales",
            "2026-01-01",
            "mode=F30",
        ])
        .unwrap();

        let Commands::Run {
            file,
            params,
            window,
            create_target,
        } = args.command
        else {
            panic!("expected the run command");
        };

        assert_eq!(file, PathBuf::from("orders.yml"));
        assert_eq!(params, Some(vec![("schema".to_string(), "sales".to_string())]));
        assert_eq!(window.overrides, vec!["2026-01-01", "mode=F30"]);
        assert!(!create_target);
    }

    #[test]
    fn test_params_require_equal_sign() {
        let result = Args::try_parse_from(["weir", "run", "-f", "orders.yml", "-p", "schema"]);
        assert!(result.is_err());
    }
}
