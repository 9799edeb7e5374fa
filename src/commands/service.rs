use dialoguer::console::{style, Term};
use serde_json::json;

use crate::commands::connect;
use crate::logs::{LogFormatter, LogPrinter};
use crate::service::{discover, validate_names, ServiceConfig};
use crate::table::{humanize, print_table};
use crate::{emit, Context, ServiceCommand, ServiceTarget, ValarError};

pub(crate) fn handle_whoami(ctx: &Context) -> Result<(), ValarError> {
    let cfg = ctx.load_remote_config()?;
    let client = ctx.client(&cfg)?;
    let user = client.user_info()?;
    emit(ctx, &user, || {
        println!("{}", style(&user.name).bold());
        if !user.projects.is_empty() {
            println!("Projects: {}", user.projects.join(", "));
        }
        Ok(())
    })
}

pub(crate) fn handle_service(ctx: &Context, command: ServiceCommand) -> Result<(), ValarError> {
    match command {
        ServiceCommand::Init {
            service,
            project,
            constructor,
            force,
        } => init_descriptor(ctx, &service, project, &constructor, force),
        ServiceCommand::List { prefix } => {
            let remote = connect(ctx, &ServiceTarget::default(), false)?;
            let services = remote
                .client
                .list_services(remote.project()?, prefix.as_deref().unwrap_or_default())?;
            let rows: Vec<Vec<String>> = services
                .iter()
                .map(|svc| {
                    vec![
                        svc.name.clone(),
                        svc.version.to_string(),
                        humanize(svc.deployed_at),
                        svc.domains.join(", "),
                    ]
                })
                .collect();
            emit(ctx, &services, || {
                print_table(&["NAME", "VERSION", "DEPLOYED", "DOMAINS"], &rows)?;
                Ok(())
            })
        }
        ServiceCommand::Logs {
            target,
            output,
            tail,
            skip,
        } => {
            let remote = connect(ctx, &target, true)?;
            let printer = LogPrinter::new(LogFormatter::for_terminal(&Term::stdout()), output.raw);
            remote.client.stream_service_logs(
                remote.project()?,
                remote.service()?,
                output.follow,
                tail,
                skip,
                &mut |entry| printer.print(&entry),
            )
        }
    }
}

fn init_descriptor(
    ctx: &Context,
    service: &str,
    project: Option<String>,
    constructor: &str,
    force: bool,
) -> Result<(), ValarError> {
    let path = ctx.work_dir.join(&ctx.service_file);
    if path.exists() && !force {
        return Err(ValarError::Config(format!(
            "{} already exists, use --force to overwrite it",
            path.display()
        )));
    }
    let project = match project.filter(|p| !p.is_empty()) {
        Some(project) => project,
        None => ctx.load_config()?.project()?.to_string(),
    };
    validate_names(&project, service)?;

    if discover(&ctx.service_file, &ctx.work_dir)?.is_some_and(|found| found.path != path) {
        tracing::warn!("a parent directory already holds a {} descriptor", ctx.service_file);
    }
    let descriptor = ServiceConfig::scaffold(path, &project, service, constructor);
    descriptor.write_back()?;
    emit(
        ctx,
        &json!({ "project": project, "service": service, "path": descriptor.path }),
        || {
            eprintln!("Created {}.", descriptor.path.display());
            Ok(())
        },
    )
}
