//! # Remora CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo service
//! remora serve -b 127.0.0.1:7000
//!
//! # Call a method (outputs raw JSON)
//! remora call 127.0.0.1:7000 echo '"hello"'
//!
//! # Stream a file to the upload method
//! remora call 127.0.0.1:7000 upload --file ./payload.bin
//!
//! # Fetch a blob; its bytes go to stdout
//! remora call 127.0.0.1:7000 download 1048576 > out.bin
//!
//! # Measure the round trip
//! remora ping 127.0.0.1:7000
//! ```

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use remora_cli::demo;
use remora_client::{Arg, ServiceProxy};
use remora_common::protocol::SlotKind;
use remora_common::session::BlobSource;
use remora_common::TransportConfig;
use remora_server::ServiceAdapter;

#[derive(FromArgs)]
/// Remora - remote method invocation with chunked blob streaming
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Ping(PingArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve the demo service
struct ServeArgs {
    /// address to bind to
    ///
    /// Defaults to "127.0.0.1:7000". Use port 0 for a random free port; the
    /// bound address is logged at startup.
    #[argh(option, short = 'b', default = "\"127.0.0.1:7000\".into()")]
    bind: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method of the demo service
struct CallArgs {
    /// address of the server, host:port
    #[argh(positional)]
    server_address: String,

    /// name of the method: echo, upload or download
    #[argh(positional)]
    method: String,

    /// JSON value of each plain parameter, in order
    #[argh(positional)]
    args: Vec<String>,

    /// file streamed into the method's blob parameter
    #[argh(option, short = 'f', long = "file")]
    file: Option<String>,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "5000")]
    timeout_ms: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// measure the round trip to a server
struct PingArgs {
    /// address of the server, host:port
    #[argh(positional)]
    server_address: String,

    /// probe timeout in milliseconds
    #[argh(option, long = "timeout-ms", default = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and ping keep stdout and stderr clean for scripting
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Ping(args) => run_ping(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = TransportConfig::from_env()?;
    let adapter = ServiceAdapter::with_config(demo::registry()?, config)?;
    let hint = adapter.listen(&args.bind).await?;
    tracing::info!("demo service '{}' ready on {}", demo::SERVICE_NAME, hint);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    tracing::info!("shutting down");
    adapter.close().await;
    Ok(())
}

/// Builds the call arguments: JSON values for plain slots, the file for the
/// blob slot.
async fn build_args(endpoint: &remora_common::Endpoint, args: &CallArgs) -> Result<Vec<Arg>> {
    if args.file.is_some() && endpoint.blob_slot().is_none() {
        bail!("{} takes no blob, --file does not apply", args.method);
    }

    let mut values = args.args.iter();
    let mut built = Vec::with_capacity(endpoint.params().len());

    for spec in endpoint.params() {
        match spec.kind {
            SlotKind::Value => {
                let raw = values
                    .next()
                    .with_context(|| format!("missing argument {} ({})", spec.order, spec.type_name))?;
                let value: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| anyhow::anyhow!("Invalid JSON in argument {}: {}", spec.order, e))?;
                built.push(Arg::Value(value));
            }
            SlotKind::Blob => {
                let path = args
                    .file
                    .as_ref()
                    .with_context(|| format!("{} streams a blob, pass --file", args.method))?;
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("failed to read {}", path))?;
                built.push(Arg::Blob(BlobSource::from_bytes("application/octet-stream", data)));
            }
        }
    }

    if values.next().is_some() {
        bail!("too many arguments for {}", args.method);
    }
    Ok(built)
}

async fn run_call(args: CallArgs) -> Result<()> {
    let endpoint = demo::endpoint(&args.method)?;
    let call_args = build_args(&endpoint, &args).await?;

    let proxy = ServiceProxy::with_config(&args.server_address, demo::service(), TransportConfig::from_env()?)?;
    proxy.open().await?;
    let result = call(&proxy, &endpoint, call_args, Duration::from_millis(args.timeout_ms)).await;
    proxy.close(true).await;
    result
}

async fn call(
    proxy: &ServiceProxy,
    endpoint: &remora_common::Endpoint,
    args: Vec<Arg>,
    timeout: Duration,
) -> Result<()> {
    let mut response = proxy.request(endpoint, timeout, args).await?;
    if !response.is_successful {
        bail!("call failed ({}): {}", response.code, response.body);
    }

    match response.take_blob_reader() {
        Some(mut reader) => {
            let mut stdout = std::io::stdout().lock();
            while let Some(chunk) = reader.next_chunk().await? {
                stdout.write_all(&chunk)?;
            }
            stdout.flush()?;
        }
        None => println!("{}", serde_json::to_string(&response.body)?),
    }
    Ok(())
}

async fn run_ping(args: PingArgs) -> Result<()> {
    let proxy = ServiceProxy::with_config(&args.server_address, demo::service(), TransportConfig::from_env()?)?;
    proxy.open().await?;
    let rtt = proxy.ping(Duration::from_millis(args.timeout_ms)).await;
    proxy.close(true).await;

    let rtt = rtt?;
    println!("{:.3}ms", rtt.as_secs_f64() * 1000.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let args: Cli = Cli::from_args(&["remora"], &["serve", "-b", "0.0.0.0:9001"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { bind }) => assert_eq!(bind, "0.0.0.0:9001"),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_default_bind() {
        let args: Cli = Cli::from_args(&["remora"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { bind }) => assert_eq!(bind, "127.0.0.1:7000"),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(&["remora"], &["call", "127.0.0.1:7000", "echo", "\"hello\""]).unwrap();
        match args.command {
            Commands::Call(CallArgs {
                server_address,
                method,
                args,
                file,
                timeout_ms,
            }) => {
                assert_eq!(server_address, "127.0.0.1:7000");
                assert_eq!(method, "echo");
                assert_eq!(args, vec!["\"hello\"".to_string()]);
                assert!(file.is_none());
                assert_eq!(timeout_ms, 5000); // default
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_with_file() {
        let args: Cli = Cli::from_args(
            &["remora"],
            &["call", "--file", "blob.bin", "--timeout-ms", "100", "127.0.0.1:7000", "upload"],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { file, timeout_ms, args, .. }) => {
                assert_eq!(file, Some("blob.bin".to_string()));
                assert_eq!(timeout_ms, 100);
                assert!(args.is_empty());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_ping() {
        let args: Cli = Cli::from_args(&["remora"], &["ping", "127.0.0.1:7000"]).unwrap();
        match args.command {
            Commands::Ping(PingArgs { server_address, timeout_ms }) => {
                assert_eq!(server_address, "127.0.0.1:7000");
                assert_eq!(timeout_ms, 2000);
            }
            _ => panic!("Expected Ping command"),
        }
    }

    #[test]
    fn test_cli_call_requires_method() {
        assert!(Cli::from_args(&["remora"], &["call", "127.0.0.1:7000"]).is_err());
    }

    #[tokio::test]
    async fn test_build_args_rejects_invalid_json() {
        let args = CallArgs {
            server_address: "127.0.0.1:7000".to_string(),
            method: "echo".to_string(),
            args: vec!["not json".to_string()],
            file: None,
            timeout_ms: 100,
        };
        let endpoint = demo::echo().unwrap();
        assert!(build_args(&endpoint, &args).await.is_err());
    }

    #[tokio::test]
    async fn test_build_args_blob_needs_file() {
        let args = CallArgs {
            server_address: "127.0.0.1:7000".to_string(),
            method: "upload".to_string(),
            args: Vec::new(),
            file: None,
            timeout_ms: 100,
        };
        let endpoint = demo::upload().unwrap();
        assert!(build_args(&endpoint, &args).await.is_err());
    }

    #[tokio::test]
    async fn test_build_args_file_needs_blob_slot() {
        let args = CallArgs {
            server_address: "127.0.0.1:7000".to_string(),
            method: "echo".to_string(),
            args: vec!["\"a\"".to_string()],
            file: Some("blob.bin".to_string()),
            timeout_ms: 100,
        };
        let endpoint = demo::echo().unwrap();
        let error = build_args(&endpoint, &args).await.unwrap_err();
        assert!(error.to_string().contains("--file"));
    }

    #[tokio::test]
    async fn test_build_args_counts_arguments() {
        let args = CallArgs {
            server_address: "127.0.0.1:7000".to_string(),
            method: "echo".to_string(),
            args: vec!["\"a\"".to_string(), "\"b\"".to_string()],
            file: None,
            timeout_ms: 100,
        };
        let endpoint = demo::echo().unwrap();
        assert!(build_args(&endpoint, &args).await.is_err());
    }
}
