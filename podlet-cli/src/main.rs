//! `podlet`: run a runnable description in a fresh worker pod.

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use podlet::{KubeCluster, RemoteConfig, RemoteRunnable, Runnable, RunnableSpec, VersionInfo};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Default, PartialEq)]
struct Args {
    runnable: PathBuf,
    input: String,
    stream: bool,
    namespace: Option<String>,
    image: Option<String>,
    /// `Some(None)` disables the secret reference.
    secret: Option<Option<String>>,
    keep_pod: bool,
    timeout_secs: Option<u64>,
}

enum Command {
    Run(Args),
    Version,
}

fn print_usage() {
    eprintln!("Usage: podlet [options] <runnable.json> <input>");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <runnable.json>      Runnable description, e.g. {{\"type\":\"passthrough\"}}");
    eprintln!("  <input>              Input value as JSON; anything else is taken as a string");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --stream             Print results as the worker produces them");
    eprintln!("  --namespace <ns>     Namespace for the worker pod [env: PODLET_NAMESPACE]");
    eprintln!("  --image <image>      Worker image [env: PODLET_IMAGE]");
    eprintln!("  --secret <name>      Secret exposed to the worker as env vars [env: PODLET_SECRET]");
    eprintln!("  --no-secret          Do not reference a secret");
    eprintln!("  --keep-pod           Leave the worker pod in place afterwards");
    eprintln!("  --timeout <secs>     Invocation time limit [env: PODLET_INVOCATION_TIMEOUT_SECS]");
    eprintln!("  --version            Print version information");
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut parsed = Args::default();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--stream" => parsed.stream = true,
            "--keep-pod" => parsed.keep_pod = true,
            "--no-secret" => parsed.secret = Some(None),
            "--namespace" => {
                i += 1;
                parsed.namespace = Some(args.get(i).ok_or("--namespace requires a value")?.clone());
            }
            "--image" => {
                i += 1;
                parsed.image = Some(args.get(i).ok_or("--image requires a value")?.clone());
            }
            "--secret" => {
                i += 1;
                parsed.secret = Some(Some(args.get(i).ok_or("--secret requires a value")?.clone()));
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout value: {raw}"))?;
                parsed.timeout_secs = Some(secs);
            }
            "--version" | "-V" => return Ok(Command::Version),
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    parsed.runnable = PathBuf::from(
        positional
            .next()
            .ok_or("missing required argument: <runnable.json>")?,
    );
    parsed.input = positional.next().ok_or("missing required argument: <input>")?;
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(Command::Run(parsed))
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PODLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!(
            "podlet={level},podlet_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

/// Command-line input: JSON when it parses, a plain string otherwise.
fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn build_config(args: &Args) -> anyhow::Result<RemoteConfig> {
    Ok(apply_flags(RemoteConfig::from_env()?, args))
}

/// Command-line flags take precedence over the environment.
fn apply_flags(mut config: RemoteConfig, args: &Args) -> RemoteConfig {
    if let Some(ns) = &args.namespace {
        config = config.with_namespace(ns.clone());
    }
    if let Some(image) = &args.image {
        config = config.with_image(image.clone());
    }
    if let Some(secret) = &args.secret {
        config = config.with_secret(secret.clone());
    }
    if args.keep_pod {
        config = config.with_delete_pod(false);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_invocation_timeout(Duration::from_secs(secs));
    }
    config
}

async fn run(args: Args) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.runnable)
        .with_context(|| format!("failed to read {}", args.runnable.display()))?;
    let spec: RunnableSpec = serde_json::from_str(&text)
        .with_context(|| format!("invalid runnable description in {}", args.runnable.display()))?;
    let input = parse_input(&args.input);
    let config = build_config(&args)?;

    let cluster = KubeCluster::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let remote = RemoteRunnable::new(spec, Arc::new(cluster), config);
    tracing::info!(runnable = %remote.name(), stream = args.stream, "Invoking");

    if args.stream {
        let mut results = remote.stream(input);
        let mut stdout = std::io::stdout();
        while let Some(item) = results.next().await {
            write!(stdout, "{}", render(&item?))?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
    } else {
        let outcome = remote.invoke_with_outcome(input).await?;
        if let Some(error) = &outcome.deletion_error {
            eprintln!("warning: {error}");
        }
        println!("{}", render(&outcome.output));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Version) => {
            let mut info = VersionInfo::new();
            if let Ok(config) = RemoteConfig::from_env() {
                info = info.with_worker_image(config.image);
            }
            match serde_json::to_string_pretty(&info) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{}", info.podlet),
            }
            return;
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn argv(list: &[&str]) -> Vec<String> {
        std::iter::once("podlet")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    fn parse(list: &[&str]) -> Args {
        match parse_args(&argv(list)) {
            Ok(Command::Run(args)) => args,
            Ok(Command::Version) => panic!("unexpected version command"),
            Err(e) => panic!("parse failed: {e}"),
        }
    }

    #[test]
    fn positional_arguments() {
        let args = parse(&["echo.json", r#"{"input":"Pikachu"}"#]);
        assert_eq!(args.runnable, PathBuf::from("echo.json"));
        assert_eq!(args.input, r#"{"input":"Pikachu"}"#);
        assert!(!args.stream);
        assert!(!args.keep_pod);
    }

    #[test]
    fn flags_anywhere() {
        let args = parse(&[
            "--stream",
            "chunks.json",
            "--namespace",
            "ml",
            "hello",
            "--keep-pod",
            "--no-secret",
            "--timeout",
            "30",
        ]);
        assert!(args.stream);
        assert!(args.keep_pod);
        assert_eq!(args.namespace.as_deref(), Some("ml"));
        assert_eq!(args.secret, Some(None));
        assert_eq!(args.timeout_secs, Some(30));
        assert_eq!(args.input, "hello");
    }

    #[test]
    fn missing_input() {
        let err = parse_args(&argv(&["echo.json"])).err().unwrap();
        assert_eq!(err, "missing required argument: <input>");
    }

    #[test]
    fn flag_without_value() {
        let err = parse_args(&argv(&["echo.json", "1", "--image"])).err().unwrap();
        assert_eq!(err, "--image requires a value");
    }

    #[test]
    fn unknown_flag() {
        let err = parse_args(&argv(&["--turbo"])).err().unwrap();
        assert_eq!(err, "unknown flag: --turbo");
    }

    #[test]
    fn input_is_json_or_string() {
        assert_eq!(parse_input(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_input("42"), json!(42));
        assert_eq!(parse_input("Pikachu"), json!("Pikachu"));
    }

    #[test]
    fn render_strings_raw() {
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!([1])), "[\n  1\n]");
    }

    #[test]
    fn flags_override_config() {
        let args = Args {
            image: Some("worker:dev".to_string()),
            keep_pod: true,
            timeout_secs: Some(9),
            ..Args::default()
        };
        let base = RemoteConfig::from_lookup(|_| None).unwrap();
        let config = apply_flags(base, &args);
        assert_eq!(config.image, "worker:dev");
        assert_eq!(config.namespace, "default");
        assert!(!config.delete_pod);
        assert_eq!(config.invocation_timeout, Some(Duration::from_secs(9)));
    }

    #[test]
    fn flags_win_over_environment() {
        let base = RemoteConfig::from_lookup(|key| match key {
            "PODLET_NAMESPACE" => Some("staging".to_string()),
            "PODLET_SECRET" => Some("team-keys".to_string()),
            _ => None,
        })
        .unwrap();
        let args = Args {
            namespace: Some("ml".to_string()),
            secret: Some(None),
            ..Args::default()
        };
        let config = apply_flags(base, &args);
        assert_eq!(config.namespace, "ml");
        assert_eq!(config.secret_name, None);
    }
}
