use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use serde_json::json;
use std::io::IsTerminal;
use tracing::info;

use crate::api::Client;
use crate::config::{CliConfig, DEFAULT_ENDPOINT_URL};
use crate::table::print_table;
use crate::{emit, ConfigCommand, Context, ContextCommand, EndpointCommand, ValarError};

const DEFAULT_CONTEXT_NAME: &str = "default";

pub(crate) fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), ValarError> {
    match command {
        ConfigCommand::Init {
            url,
            token,
            project,
            name,
            force,
        } => handle_init(
            ctx,
            InitOptions {
                url,
                token,
                project,
                name,
                force,
            },
        ),
        ConfigCommand::View => {
            let cfg = masked(&ctx.load_config()?);
            emit(ctx, &cfg, || {
                print!("{}", serde_yaml::to_string(&cfg)?);
                Ok(())
            })
        }
        ConfigCommand::Endpoint { command } => handle_endpoint(ctx, command),
        ConfigCommand::Context { command } => handle_context(ctx, command),
    }
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{tail}")
}

/// Copy of `cfg` safe to print: every endpoint token is masked.
fn masked(cfg: &CliConfig) -> CliConfig {
    let mut cfg = cfg.clone();
    for endpoint in cfg.endpoints.values_mut() {
        endpoint.token = mask_token(&endpoint.token);
    }
    cfg
}

fn handle_endpoint(ctx: &Context, command: Option<EndpointCommand>) -> Result<(), ValarError> {
    let mut cfg = ctx.load_config()?;
    match command {
        None => {
            let rows: Vec<Vec<String>> = cfg
                .endpoints
                .iter()
                .map(|(name, endpoint)| {
                    vec![name.clone(), endpoint.url.clone(), mask_token(&endpoint.token)]
                })
                .collect();
            let payload: Vec<_> = cfg
                .endpoints
                .iter()
                .map(|(name, endpoint)| {
                    json!({ "name": name, "url": endpoint.url, "token": mask_token(&endpoint.token) })
                })
                .collect();
            emit(ctx, &payload, || {
                print_table(&["NAME", "URL", "TOKEN"], &rows)?;
                Ok(())
            })
        }
        Some(EndpointCommand::Set { name, url, token }) => {
            cfg.set_endpoint(&name, url, token);
            cfg.write()?;
            info!(endpoint = %name, path = %cfg.path.display(), "endpoint updated");
            let endpoint = &cfg.endpoints[&name];
            emit(
                ctx,
                &json!({ "name": name, "url": endpoint.url }),
                || Ok(()),
            )
        }
        Some(EndpointCommand::Remove { name }) => {
            cfg.remove_endpoint(&name)?;
            cfg.write()?;
            emit(ctx, &json!({ "removed": name }), || Ok(()))
        }
    }
}

fn handle_context(ctx: &Context, command: Option<ContextCommand>) -> Result<(), ValarError> {
    let mut cfg = ctx.load_config()?;
    match command {
        None => {
            let rows: Vec<Vec<String>> = cfg
                .contexts
                .iter()
                .map(|(name, context)| {
                    let active = if *name == cfg.active_context { "*" } else { "" };
                    vec![
                        active.to_string(),
                        name.clone(),
                        context.endpoint.clone(),
                        context.project.clone(),
                    ]
                })
                .collect();
            emit(
                ctx,
                &json!({ "activeContext": cfg.active_context, "contexts": cfg.contexts }),
                || {
                    print_table(&["ACTIVE", "NAME", "ENDPOINT", "PROJECT"], &rows)?;
                    Ok(())
                },
            )
        }
        Some(ContextCommand::Set {
            name,
            endpoint,
            project,
        }) => {
            cfg.set_context(&name, endpoint, project);
            cfg.write()?;
            let context = &cfg.contexts[&name];
            emit(
                ctx,
                &json!({ "name": name, "endpoint": context.endpoint, "project": context.project }),
                || Ok(()),
            )
        }
        Some(ContextCommand::Use { name }) => {
            cfg.use_context(&name)?;
            cfg.write()?;
            emit(ctx, &json!({ "activeContext": name }), || {
                eprintln!("Switched to context {}.", style(&name).bold());
                Ok(())
            })
        }
        Some(ContextCommand::Remove { name }) => {
            cfg.remove_context(&name)?;
            cfg.write()?;
            emit(ctx, &json!({ "removed": name }), || Ok(()))
        }
    }
}

struct InitOptions {
    url: Option<String>,
    token: Option<String>,
    project: Option<String>,
    name: Option<String>,
    force: bool,
}

/// Writes an endpoint and a context under the same name and activates it.
fn apply_init(cfg: &mut CliConfig, name: &str, url: &str, token: &str, project: &str) {
    cfg.endpoints.remove(name);
    cfg.set_endpoint(name, Some(url.to_string()), Some(token.to_string()));
    cfg.contexts.remove(name);
    cfg.set_context(name, Some(name.to_string()), Some(project.to_string()));
    cfg.active_context = name.to_string();
}

fn handle_init(ctx: &Context, opts: InitOptions) -> Result<(), ValarError> {
    let mut cfg = ctx.load_config()?;
    let theme = ColorfulTheme::default();
    let interactive =
        (opts.token.is_none() || opts.project.is_none()) && std::io::stdin().is_terminal();

    let url = match opts.url {
        Some(url) => url,
        None if interactive => Input::<String>::with_theme(&theme)
            .with_prompt("API endpoint URL")
            .default(DEFAULT_ENDPOINT_URL.to_string())
            .interact_text()?,
        None => DEFAULT_ENDPOINT_URL.to_string(),
    };
    let token = match opts.token {
        Some(token) => token,
        None if interactive => Password::with_theme(&theme)
            .with_prompt("API token")
            .allow_empty_password(true)
            .interact()?,
        None => String::new(),
    };
    if token.trim().is_empty() {
        return Err(ValarError::Validation("token is required".to_string()));
    }

    eprint!("Verifying credentials... ");
    if let Err(err) = Client::connect(&url, &token) {
        eprintln!("{}", style("failed.").red());
        return Err(err);
    }
    eprintln!("{}", style("done.").green());

    let project = match opts.project {
        Some(project) => project,
        None if interactive => Input::<String>::with_theme(&theme)
            .with_prompt("Project")
            .allow_empty(true)
            .interact_text()?,
        None => String::new(),
    };
    if project.trim().is_empty() {
        return Err(ValarError::Validation("project is required".to_string()));
    }

    let name = match opts.name {
        Some(name) => name,
        None if interactive => Input::<String>::with_theme(&theme)
            .with_prompt("Context name")
            .default(DEFAULT_CONTEXT_NAME.to_string())
            .interact_text()?,
        None => DEFAULT_CONTEXT_NAME.to_string(),
    };

    let exists = cfg.endpoints.contains_key(&name) || cfg.contexts.contains_key(&name);
    if exists && !opts.force {
        if !interactive {
            return Err(ValarError::Config(format!(
                "context '{name}' already exists (use --force to overwrite)"
            )));
        }
        let overwrite = Confirm::with_theme(&theme)
            .with_prompt(format!("Context '{name}' already exists. Overwrite?"))
            .default(false)
            .interact()?;
        if !overwrite {
            return Err(ValarError::Config("aborted".to_string()));
        }
    }

    apply_init(&mut cfg, &name, &url, &token, &project);
    cfg.write()?;
    emit(
        ctx,
        &json!({ "context": name, "project": project, "path": cfg.path }),
        || {
            eprintln!("Configuration written to {}.", cfg.path.display());
            Ok(())
        },
    )
}
