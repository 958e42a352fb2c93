use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use glue_cni_plugin::config::{Args, Command};
use glue_cni_plugin::delegate::ExecDelegate;
use glue_cni_plugin::neighbor::NetnsNeighbors;
use glue_cni_plugin::response::Response;
use glue_cni_plugin::types::NetConf;
use glue_cni_plugin::{CNI_VERSION, Error, Result, add, check, delete, gc, version};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_DIR: &str = "/var/log/glue-cni";

fn main() -> ExitCode {
    let _guard = setup_logging();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            error!(%e, "invalid plugin arguments");
            return Error::InvalidRequiredEnvVariables(e.to_string())
                .into_response(CNI_VERSION)
                .write_out();
        }
    };

    if args.command == Command::Version {
        return version::version().write_out();
    }

    let conf = match read_input() {
        Ok(conf) => conf,
        Err(e) => {
            error!(%e, "failed to read network configuration");
            return e.into_response(CNI_VERSION).write_out();
        }
    };

    let delegate = ExecDelegate::new(&args);
    let resp: Response = match args.command {
        Command::Add => add::add(&args, conf, &delegate, &NetnsNeighbors),
        Command::Delete => delete::delete(&args, conf, &delegate),
        Command::Check => check::check(&args, conf, &delegate),
        Command::Status => gc::status(&args, conf),
        Command::Gc => gc::gc(&args, conf),
        Command::Version => version::version(),
    };

    resp.write_out()
}

fn read_input() -> Result<NetConf> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(serde_json::from_str(&buf)?)
}

// stdout carries the CNI result, so logs go to a file
fn setup_logging() -> Option<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cni.log")
        .build(LOG_DIR)
        .ok()?;
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glue_cni_plugin=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(nonblocking),
        )
        .init();
    Some(guard)
}
