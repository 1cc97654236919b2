//! Command-line interface of the `berth` binary.

use anyhow::{bail, Context};
use berth_core::wait::{CompositeWait, TimeoutMode};
use berth_core::{BerthSettings, ContainerConfig, Wait, WaitStrategy};
use berth_engine::ContainerRequest;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Start disposable containers and wait until they are ready.
#[derive(Parser, Debug)]
#[command(name = "berth", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Starts a container, prints its endpoints and keeps it running until Ctrl-C.
    Run(RunArgs),
}

/// Arguments of `berth run`.
#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Image to run, e.g. `redis:7-alpine`.
    #[arg(value_name = "IMAGE")]
    pub(crate) image: String,

    /// Container name.
    #[arg(long)]
    pub(crate) name: Option<String>,

    /// Container TCP port to publish on a random host port.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub(crate) ports: Vec<u16>,

    /// Environment variable in `KEY=VALUE` form.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub(crate) env: Vec<(String, String)>,

    /// Wait for the published ports to accept connections.
    #[arg(long)]
    pub(crate) wait_port: bool,

    /// Wait for a line of output matching this regular expression.
    #[arg(long, value_name = "REGEX")]
    pub(crate) wait_log: Option<String>,

    /// How many matching lines `--wait-log` requires.
    #[arg(long, default_value_t = 1, requires = "wait_log")]
    pub(crate) times: usize,

    /// Wait for an HTTP request to this path to succeed.
    #[arg(long, value_name = "PATH")]
    pub(crate) wait_http: Option<String>,

    /// Container port for `--wait-http` (default: first published port).
    #[arg(long, value_name = "PORT", requires = "wait_http")]
    pub(crate) http_port: Option<u16>,

    /// Accepted status code for `--wait-http` (default: 200).
    #[arg(long = "status", value_name = "CODE", requires = "wait_http")]
    pub(crate) status_codes: Vec<u16>,

    /// Wait for the image healthcheck to report healthy.
    #[arg(long)]
    pub(crate) wait_healthy: bool,

    /// Wait for the container process to exit.
    #[arg(long)]
    pub(crate) wait_exit: bool,

    /// Wait for this shell command to succeed inside the container.
    #[arg(long, value_name = "CMD")]
    pub(crate) wait_command: Option<String>,

    /// Startup timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,

    /// Whole-start attempts.
    #[arg(long, value_name = "N")]
    pub(crate) attempts: Option<u32>,

    /// Command overriding the image default.
    #[arg(
        value_name = "COMMAND",
        num_args = 0..,
        last = true,
        allow_hyphen_values = true
    )]
    pub(crate) command: Vec<String>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

impl RunArgs {
    /// Build the container request.
    pub(crate) fn request(&self) -> anyhow::Result<ContainerRequest> {
        let mut builder = ContainerRequest::builder(&self.image).command(self.command.clone());
        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        for port in &self.ports {
            builder = builder.expose(*port);
        }
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        Ok(builder.build()?)
    }

    /// The requested strategies, in the order they run.
    fn strategies(&self) -> anyhow::Result<Vec<Box<dyn WaitStrategy>>> {
        let mut strategies: Vec<Box<dyn WaitStrategy>> = Vec::new();
        if self.wait_port {
            strategies.push(Box::new(Wait::for_listening_port()));
        }
        if let Some(pattern) = &self.wait_log {
            strategies.push(Box::new(
                Wait::for_log_message(pattern, self.times).context("invalid --wait-log")?,
            ));
        }
        if let Some(path) = &self.wait_http {
            let mut probe = Wait::for_http(path.clone());
            if let Some(port) = self.http_port {
                probe = probe.for_port(port);
            }
            for code in &self.status_codes {
                probe = probe.for_status_code(*code);
            }
            strategies.push(Box::new(probe));
        }
        if self.wait_healthy {
            strategies.push(Box::new(Wait::for_healthcheck()));
        }
        if let Some(command) = &self.wait_command {
            strategies.push(Box::new(Wait::for_successful_command([
                "sh".to_string(),
                "-c".to_string(),
                command.clone(),
            ])));
        }
        if self.wait_exit {
            strategies.push(Box::new(Wait::for_exit()));
        }
        Ok(strategies)
    }

    /// Build the container configuration.
    ///
    /// Several `--wait-*` flags run one after another under one shared
    /// timeout. Without `--timeout` the timeout comes from `settings`.
    pub(crate) fn config(&self, settings: BerthSettings) -> anyhow::Result<ContainerConfig> {
        if self.timeout == Some(0) {
            bail!("--timeout must be at least 1 second");
        }
        let startup_timeout = self
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.startup_timeout);

        let mut builder = ContainerConfig::builder(self.request()?).settings(settings);
        let mut strategies = self.strategies()?;
        match strategies.len() {
            0 => {}
            1 => builder = builder.wait_for_boxed(strategies.remove(0)),
            _ => {
                let mut composite = CompositeWait::new(TimeoutMode::SharedOuterTimeout);
                for strategy in strategies {
                    composite.add(strategy)?;
                }
                builder = builder.wait_for(composite);
            }
        }
        builder = builder.startup_timeout(startup_timeout);
        if let Some(attempts) = self.attempts {
            builder = builder.startup_attempts(attempts);
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(["berth", "run"].iter().chain(args)).unwrap();
        match cli.command {
            CliCommand::Run(args) => args,
        }
    }

    #[test]
    fn test_parses_request() {
        let args = run(&[
            "redis:7",
            "--name",
            "cache",
            "-p",
            "6379",
            "-e",
            "A=1",
            "-e",
            "B=x=y",
            "--",
            "redis-server",
            "--save",
            "",
        ]);
        let request = args.request().unwrap();

        assert_eq!(request.image, "redis:7");
        assert_eq!(request.name.as_deref(), Some("cache"));
        assert_eq!(request.exposed_ports, vec![6379]);
        assert_eq!(request.env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(request.command, vec!["redis-server", "--save", ""]);
    }

    #[test]
    fn test_rejects_bad_env() {
        assert!(Cli::try_parse_from(["berth", "run", "redis", "-e", "=1"]).is_err());
        assert!(Cli::try_parse_from(["berth", "run", "redis", "-e", "NOVALUE"]).is_err());
    }

    #[test]
    fn test_single_wait_flag_uses_timeout() {
        let config = run(&["nginx", "-p", "80", "--wait-http", "/", "--timeout", "7"])
            .config(BerthSettings::default())
            .unwrap();
        assert_eq!(
            config.wait_strategy().startup_timeout(),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_several_wait_flags_share_timeout() {
        let config = run(&[
            "postgres:16",
            "-p",
            "5432",
            "--wait-port",
            "--wait-log",
            "ready to accept",
            "--times",
            "2",
            "--timeout",
            "20",
        ])
        .config(BerthSettings::default())
        .unwrap();

        let wait = config.wait_strategy();
        assert_eq!(wait.startup_timeout(), Duration::from_secs(20));
        assert!(format!("{wait:?}").contains("CompositeWait"));
    }

    #[test]
    fn test_wait_flags_default_to_settings_timeout() {
        let settings = BerthSettings {
            startup_timeout: Duration::from_secs(5),
            ..BerthSettings::default()
        };

        let single = run(&["redis", "--wait-log", "ready"])
            .config(settings.clone())
            .unwrap();
        assert_eq!(single.wait_strategy().startup_timeout(), Duration::from_secs(5));

        let composite = run(&["redis", "-p", "6379", "--wait-port", "--wait-log", "ready"])
            .config(settings.clone())
            .unwrap();
        assert_eq!(composite.wait_strategy().startup_timeout(), Duration::from_secs(5));

        let explicit = run(&["redis", "--wait-log", "ready", "--timeout", "12"])
            .config(settings)
            .unwrap();
        assert_eq!(explicit.wait_strategy().startup_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_no_wait_flag_defaults_to_ports() {
        let settings = BerthSettings {
            startup_timeout: Duration::from_secs(9),
            ..BerthSettings::default()
        };
        let config = run(&["redis", "-p", "6379"]).config(settings).unwrap();
        assert_eq!(config.wait_strategy().startup_timeout(), Duration::from_secs(9));
        assert!(format!("{:?}", config.wait_strategy()).contains("PortOpen"));
    }

    #[test]
    fn test_invalid_inputs_fail() {
        assert!(run(&["redis", "--wait-log", "(unclosed"])
            .config(BerthSettings::default())
            .is_err());
        assert!(run(&["redis", "--timeout", "0"])
            .config(BerthSettings::default())
            .is_err());
        assert!(run(&["redis", "--attempts", "0"])
            .config(BerthSettings::default())
            .is_err());
        assert!(Cli::try_parse_from(["berth", "run", "redis", "--times", "2"]).is_err());
    }
}
