mod config;
mod mux;
mod probe;
mod rpc;
mod runner;

use clap::Parser;
use config::ProbeConfig;
use std::path::PathBuf;

/// Smoke-test a JSON-RPC server that speaks newline-delimited JSON over
/// stdio: launch it, run the initialize handshake and a tools/list query,
/// and print everything observed on both of its output streams.
#[derive(Parser, Debug)]
#[command(name = "stdio-probe", version, about)]
pub struct Cli {
    /// Server command to launch (overrides config)
    #[arg(value_name = "COMMAND")]
    command: Option<String>,

    /// Arguments passed to the server command
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "probe.toml")]
    config: PathBuf,

    /// Environment variable for the server, KEY=VALUE (repeatable)
    #[arg(short, long, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Initialize timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Startup grace period in seconds (overrides config)
    #[arg(long)]
    startup_wait: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (stream lifecycle, poll decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress the transcript, only errors and the exit code
    #[arg(short, long)]
    quiet: bool,
}

/// Fold CLI flags into the loaded config. A positional command replaces
/// both the configured command and its args.
fn merge_cli(config: &mut ProbeConfig, cli: &Cli) -> Result<(), String> {
    if let Some(command) = &cli.command {
        config.server.command = command.clone();
        config.server.args = cli.args.clone();
    }
    for pair in &cli.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --env value '{}', expected KEY=VALUE", pair))?;
        config
            .server
            .env
            .insert(key.to_string(), value.to_string());
    }
    if let Some(secs) = cli.timeout {
        config.timing.init_timeout_secs = secs;
    }
    if let Some(secs) = cli.startup_wait {
        config.timing.startup_wait_secs = secs;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match ProbeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("stdio-probe: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(msg) = merge_cli(&mut config, &cli) {
        eprintln!("stdio-probe: {}", msg);
        std::process::exit(2);
    }
    if let Err(e) = config.validate() {
        eprintln!("stdio-probe: {}", e);
        std::process::exit(2);
    }

    if cli.dry_run {
        println!("stdio-probe v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "command:        {} {}",
            config.server.command,
            config.server.args.join(" ")
        );
        for (key, value) in &config.server.env {
            println!("env:            {}={}", key, value);
        }
        println!("startup wait:   {}s", config.timing.startup_wait_secs);
        println!("init timeout:   {}s", config.timing.init_timeout_secs);
        println!("list timeout:   {}s", config.timing.list_timeout_secs);
        println!("poll quantum:   {}ms", config.timing.poll_quantum_ms);
        println!("shutdown grace: {}s", config.timing.shutdown_grace_secs);
        println!("Dry run mode — config validated, not running.");
        return;
    }

    match runner::run(&config, cli.quiet).await {
        Ok(outcome) => {
            runner::print_summary(&outcome, cli.quiet);
            std::process::exit(outcome.exit_code());
        }
        Err(e) => {
            eprintln!("stdio-probe: {}", e);
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_cli() -> Cli {
        Cli::parse_from(["stdio-probe"])
    }

    #[test]
    fn test_merge_positional_command_replaces_config() {
        let mut config = ProbeConfig::default();
        config.server.command = "from-config".to_string();
        config.server.args = vec!["--old".to_string()];

        let cli = Cli::parse_from(["stdio-probe", "./server", "--stdio"]);
        merge_cli(&mut config, &cli).unwrap();
        assert_eq!(config.server.command, "./server");
        assert_eq!(config.server.args, vec!["--stdio"]);
    }

    #[test]
    fn test_merge_env_pairs() {
        let mut config = ProbeConfig::default();
        let cli = Cli::parse_from([
            "stdio-probe",
            "--env",
            "LOG_LEVEL=debug",
            "--env",
            "LOG_FORMAT=text",
        ]);
        merge_cli(&mut config, &cli).unwrap();
        assert_eq!(
            config.server.env.get("LOG_LEVEL"),
            Some(&"debug".to_string())
        );
        assert_eq!(
            config.server.env.get("LOG_FORMAT"),
            Some(&"text".to_string())
        );
    }

    #[test]
    fn test_merge_env_value_may_contain_equals() {
        let mut config = ProbeConfig::default();
        let cli = Cli::parse_from(["stdio-probe", "--env", "OPTS=a=b"]);
        merge_cli(&mut config, &cli).unwrap();
        assert_eq!(config.server.env.get("OPTS"), Some(&"a=b".to_string()));
    }

    #[test]
    fn test_merge_invalid_env_rejected() {
        let mut config = ProbeConfig::default();
        let cli = Cli::parse_from(["stdio-probe", "--env", "NO_EQUALS"]);
        let err = merge_cli(&mut config, &cli).unwrap_err();
        assert!(err.contains("KEY=VALUE"));
    }

    #[test]
    fn test_merge_timing_overrides() {
        let mut config = ProbeConfig::default();
        let cli = Cli::parse_from(["stdio-probe", "--timeout", "30", "--startup-wait", "0"]);
        merge_cli(&mut config, &cli).unwrap();
        assert_eq!(config.timing.init_timeout_secs, 30);
        assert_eq!(config.timing.startup_wait_secs, 0);
    }

    #[test]
    fn test_merge_no_flags_keeps_config() {
        let mut config = ProbeConfig::default();
        config.server.command = "keep-me".to_string();
        merge_cli(&mut config, &bare_cli()).unwrap();
        assert_eq!(config.server.command, "keep-me");
        assert_eq!(config.timing.init_timeout_secs, 10);
    }
}
