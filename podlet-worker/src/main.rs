//! Worker pod entry point.
//!
//! Reads the runnable and its input from stdin, writes results to stdout.
//! Stderr carries nothing but a fatal error line, so logging goes out as
//! comment lines on stdout through the worker tracing layer.

use std::process::ExitCode;

use podlet::{
    CatalogLoader, ExecutionMode, LogSink, VersionInfo, WorkerConfig, WorkerTracingLayer,
    run_worker,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

enum Command {
    Run(ExecutionMode),
    Version,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut mode = ExecutionMode::OneShot;
    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--stream" => mode = ExecutionMode::Streaming,
            "--version" | "-V" => return Ok(Command::Version),
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Command::Run(mode))
}

fn init_tracing(sink: LogSink) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PODLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "podlet={level},podlet_worker={level},podlet::bridge=off",
            level = base_level
        ))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(WorkerTracingLayer::new(sink))
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let mode = match parse_args(&args) {
        Ok(Command::Run(mode)) => mode,
        Ok(Command::Version) => {
            let info = VersionInfo::new();
            match serde_json::to_string(&info) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{}", info.podlet),
            }
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("Usage: podlet-worker [--stream]");
            return ExitCode::from(2);
        }
    };

    let sink = LogSink::new();
    init_tracing(sink.clone());

    let config = WorkerConfig::new(mode).with_log_sink(sink);
    let result = run_worker(
        &CatalogLoader,
        config,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        // The error line is already on stderr.
        Err(_) => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("podlet-worker")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn one_shot_by_default() {
        assert!(matches!(
            parse_args(&args(&[])),
            Ok(Command::Run(ExecutionMode::OneShot))
        ));
    }

    #[test]
    fn stream_flag() {
        assert!(matches!(
            parse_args(&args(&["--stream"])),
            Ok(Command::Run(ExecutionMode::Streaming))
        ));
    }

    #[test]
    fn unknown_argument() {
        let err = parse_args(&args(&["--fast"])).err().unwrap();
        assert_eq!(err, "unknown argument: --fast");
    }

    #[test]
    fn version_flag() {
        assert!(matches!(parse_args(&args(&["-V"])), Ok(Command::Version)));
    }
}
