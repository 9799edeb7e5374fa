mod api;
mod archive;
mod commands;
mod config;
mod logs;
mod permission;
mod service;
mod table;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::env;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::api::{ApiError, Client};
use crate::config::CliConfig;
use crate::service::{ResolvedServiceConfig, DEFAULT_SERVICE_FILE};

const LOG_FILTER_ENV: &str = "VALAR_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "valar",
    version,
    about = "Valar is a next-generation serverless platform",
    long_about = "Valar is a next-generation serverless platform.\n\nYou code. We do the rest."
)]
struct Cli {
    /// Semicolon-separated list of config files, merged in order.
    #[arg(long, global = true)]
    config: Option<String>,
    #[arg(long, global = true)]
    json: bool,
    /// Name of the service descriptor searched for in the working directory and its parents.
    #[arg(long = "service-file", global = true, default_value = DEFAULT_SERVICE_FILE)]
    service_file: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure the CLI tool.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show the user behind the active context.
    Whoami,
    /// Manage services.
    #[command(visible_aliases = ["services", "svc"])]
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    /// Manage the builds of a service.
    #[command(visible_aliases = ["builds", "b"])]
    Build {
        #[command(flatten)]
        target: ServiceTarget,
        #[command(subcommand)]
        command: BuildCommand,
    },
    /// Manage the deployments of a service.
    #[command(visible_aliases = ["deployments", "deploy", "d"])]
    Deployment {
        #[command(flatten)]
        target: ServiceTarget,
        #[command(subcommand)]
        command: DeploymentCommand,
    },
    /// Manage custom domains.
    #[command(visible_aliases = ["domains", "dom"])]
    Domain {
        #[command(subcommand)]
        command: DomainCommand,
    },
    /// Manage scheduled invocations of a service.
    Cron {
        #[command(flatten)]
        target: ServiceTarget,
        #[command(subcommand)]
        command: CronCommand,
    },
    /// Manage environment variables of the service descriptor.
    Env {
        /// Build scope instead of deployment scope.
        #[arg(long, short = 'b', global = true)]
        build: bool,
        /// Display format of the listing.
        #[arg(long, value_parser = ["table", "raw"], default_value = "table")]
        format: String,
        #[command(subcommand)]
        command: Option<EnvCommand>,
    },
    /// Manage project permissions.
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ServiceTarget {
    /// Target service, overriding the one from the service descriptor.
    #[arg(long, short = 's', global = true)]
    service: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Set up a new CLI configuration interactively.
    Init {
        /// API endpoint URL [default: https://api.valar.dev/v2]
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        project: Option<String>,
        /// Name of the endpoint and context to create [default: default]
        #[arg(long)]
        name: Option<String>,
        /// Overwrite an existing context of the same name.
        #[arg(long)]
        force: bool,
    },
    /// View the merged configuration as YAML, with endpoint tokens masked.
    View,
    /// Manage API endpoints.
    Endpoint {
        #[command(subcommand)]
        command: Option<EndpointCommand>,
    },
    /// Manage CLI contexts.
    Context {
        #[command(subcommand)]
        command: Option<ContextCommand>,
    },
}

#[derive(Subcommand, Debug)]
enum EndpointCommand {
    /// Configure an API endpoint.
    Set {
        name: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Drop an API endpoint from the configuration.
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum ContextCommand {
    /// Configure a CLI context.
    Set {
        name: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Change the active context.
    Use { name: String },
    /// Drop a context from the configuration.
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    /// Create a service descriptor in the working directory.
    Init {
        service: String,
        #[arg(long, short = 'p')]
        project: Option<String>,
        #[arg(long, short = 'c')]
        constructor: String,
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// List services of the project.
    List { prefix: Option<String> },
    /// Show the logs of the latest service deployment.
    Logs {
        #[command(flatten)]
        target: ServiceTarget,
        #[command(flatten)]
        output: LogOutput,
        /// Start from the end of the log instead of the beginning.
        #[arg(long)]
        tail: bool,
        /// Number of entries to skip.
        #[arg(long, default_value_t = 0)]
        skip: u64,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct LogOutput {
    /// Follow the logs until the server closes the stream.
    #[arg(long, short = 'f')]
    follow: bool,
    /// Dump the unformatted log content.
    #[arg(long, short = 'r')]
    raw: bool,
}

#[derive(Subcommand, Debug)]
enum BuildCommand {
    /// List builds of the service.
    List { prefix: Option<String> },
    /// Inspect the first matched build with the given ID prefix.
    Inspect { prefix: String },
    /// Show the build logs of the latest build matching the prefix.
    Logs {
        prefix: Option<String>,
        #[command(flatten)]
        output: LogOutput,
    },
    /// Abort a scheduled or running build.
    Abort { prefix: Option<String> },
    /// Show the status of the given build; exits non-zero unless it is done.
    Status { id: String },
    /// Watch a build until its completion.
    Watch { prefix: Option<String> },
    /// Push and build a new version.
    Push {
        folder: Option<PathBuf>,
        /// Only build, skip the deploy action.
        #[arg(long)]
        skip_deploy: bool,
        /// Watch the submitted build until it completes.
        #[arg(long, short = 'w')]
        watch: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DeploymentCommand {
    /// List all deployments of the service.
    List,
    /// Deploy the given build, or the latest one.
    Create { build: Option<String> },
    /// Roll back to a previous deployment version.
    Rollback { version: i64 },
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    /// List all domains bound to the active project.
    #[command(visible_alias = "l")]
    List,
    /// Add a new domain to the project.
    Add { domain: String },
    /// Delete an existing domain from the project.
    Delete { domain: String },
    /// Verify a newly added domain.
    Verify { domain: String },
    /// Link a domain to a service.
    Link {
        domain: String,
        #[command(flatten)]
        target: ServiceTarget,
        /// Allow insecure traffic, disabling the default HTTPS redirect.
        #[arg(long, short = 'i')]
        insecure: bool,
    },
    /// Unlink a domain from a service.
    Unlink {
        domain: String,
        #[command(flatten)]
        target: ServiceTarget,
    },
}

#[derive(Subcommand, Debug)]
enum CronCommand {
    /// List all cron schedules of the service.
    List,
    /// Create or update a service invocation schedule.
    Set {
        name: String,
        timespec: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, visible_alias = "enabled", conflicts_with = "disable")]
        enable: bool,
        #[arg(long, visible_alias = "disabled")]
        disable: bool,
    },
    /// Manually trigger a scheduled invocation.
    Trigger { name: String },
    /// Delete a service invocation schedule.
    Delete { name: String },
    /// Inspect the details of a service schedule.
    Inspect { name: String },
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// Set a variable to the given value.
    Set {
        /// Assignment in KEY=VALUE form.
        assignment: String,
        /// Encrypt the value and hide it in listings.
        #[arg(long)]
        secret: bool,
    },
    /// Delete the environment variable.
    Delete { key: String },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// List permissions, optionally below a path such as `service:my-proj`.
    List { path: Option<String> },
    /// Check whether a user may perform an action on a path.
    Check {
        path: String,
        user: String,
        action: String,
    },
    /// Allow a user to perform an action on a path.
    Allow {
        path: String,
        user: String,
        action: String,
    },
    /// Forbid a user to perform an action on a path.
    Deny {
        path: String,
        user: String,
        action: String,
    },
    /// Drop an explicit permission so the inherited one applies.
    Reset {
        path: String,
        user: String,
        action: String,
    },
}

#[derive(Debug, Error)]
pub(crate) enum ValarError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Request {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("build {id} did not succeed (status: {status})")]
    BuildNotSucceeded { id: String, status: String },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

/// Per-invocation settings, built once from the global flags and passed to every handler.
#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub(crate) config_paths: Vec<PathBuf>,
    pub(crate) service_file: String,
    pub(crate) work_dir: PathBuf,
    pub(crate) json: bool,
}

impl Context {
    pub(crate) fn load_config(&self) -> Result<CliConfig, ValarError> {
        config::load(&self.config_paths)
    }

    /// Loads the config and warns when the active context cannot reach a server.
    pub(crate) fn load_remote_config(&self) -> Result<CliConfig, ValarError> {
        let cfg = self.load_config()?;
        if !cfg.active_context_is_usable() {
            tracing::warn!(
                "active context is invalid; choose or configure a new context using `valar config`"
            );
        }
        Ok(cfg)
    }

    pub(crate) fn resolve_service(
        &self,
        cfg: &CliConfig,
        service_override: Option<&str>,
    ) -> Result<ResolvedServiceConfig, ValarError> {
        service::resolve_with_fallback(&self.service_file, &self.work_dir, service_override, cfg)
    }

    pub(crate) fn client(&self, cfg: &CliConfig) -> Result<Client, ValarError> {
        Client::connect(cfg.endpoint_url()?, cfg.token()?)
    }
}

fn main() -> Result<(), ValarError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = build_context(&cli)?;

    let result = match cli.command {
        Commands::Config { command } => commands::config::handle_config(&ctx, command),
        Commands::Whoami => commands::service::handle_whoami(&ctx),
        Commands::Service { command } => commands::service::handle_service(&ctx, command),
        Commands::Build { target, command } => {
            commands::build::handle_build(&ctx, &target, command)
        }
        Commands::Deployment { target, command } => {
            commands::deployment::handle_deployment(&ctx, &target, command)
        }
        Commands::Domain { command } => commands::domain::handle_domain(&ctx, command),
        Commands::Cron { target, command } => commands::cron::handle_cron(&ctx, &target, command),
        Commands::Env {
            build,
            format,
            command,
        } => commands::env::handle_env(&ctx, build, &format, command),
        Commands::Auth { command } => commands::auth::handle_auth(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

fn build_context(cli: &Cli) -> Result<Context, ValarError> {
    let config_paths = config::search_paths(cli.config.as_deref())?;
    let work_dir = env::current_dir()?;
    Ok(Context {
        config_paths,
        service_file: cli.service_file.clone(),
        work_dir,
        json: cli.json,
    })
}

/// Prints `payload` as a JSON envelope in `--json` mode, otherwise runs the human renderer.
pub(crate) fn emit<T, F>(ctx: &Context, payload: &T, human: F) -> Result<(), ValarError>
where
    T: Serialize,
    F: FnOnce() -> Result<(), ValarError>,
{
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)
    } else {
        human()
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ValarError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
