use dialoguer::console::Term;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::api::{kv_pairs, Build, BuildRequest, BuildRequestSpec, DeploymentRequestSpec};
use crate::archive::compress_dir;
use crate::commands::{latest_build, resolve, Remote};
use crate::logs::{watch_build, LogFormatter, LogPrinter, TermWatchDisplay};
use crate::service::{validate_names, ResolvedServiceConfig};
use crate::table::{colorize_status, humanize, print_fields, print_table, status_exit_code};
use crate::{emit, BuildCommand, Context, ServiceTarget, ValarError};

pub(crate) fn handle_build(
    ctx: &Context,
    target: &ServiceTarget,
    command: BuildCommand,
) -> Result<(), ValarError> {
    let pending = resolve(ctx, target, true)?;
    if let BuildCommand::Push { folder, .. } = &command {
        check_pushable(&pending.target, &push_folder(ctx, folder.clone()))?;
    }
    let remote = pending.connect(ctx)?;
    match command {
        BuildCommand::List { prefix } => list_builds(ctx, &remote, prefix.as_deref().unwrap_or_default()),
        BuildCommand::Inspect { prefix } => {
            let build = latest_build(&remote, &prefix)?;
            let build = remote
                .client
                .inspect_build(remote.project()?, remote.service()?, &build.id)?;
            emit(ctx, &build, || {
                let mut fields = vec![
                    ("ID", build.id.clone()),
                    ("Constructor", build.constructor.clone()),
                    ("CreatedAt", build.created_at.to_rfc3339()),
                    ("Status", colorize_status(&build.status)),
                    ("Flags", build.flags.clone()),
                    ("Owner", build.owner.clone()),
                ];
                if !build.error.is_empty() {
                    fields.push(("Error", build.error.clone()));
                }
                print_fields(&fields)?;
                Ok(())
            })
        }
        BuildCommand::Logs { prefix, output } => {
            let build = latest_build(&remote, prefix.as_deref().unwrap_or_default())?;
            let printer = LogPrinter::new(LogFormatter::for_terminal(&Term::stdout()), output.raw);
            remote.client.build_logs(
                remote.project()?,
                remote.service()?,
                &build.id,
                output.follow,
                &mut |entry| printer.print(&entry),
            )
        }
        BuildCommand::Abort { prefix } => {
            let build = latest_build(&remote, prefix.as_deref().unwrap_or_default())?;
            remote
                .client
                .abort_build(remote.project()?, remote.service()?, &build.id)?;
            emit(ctx, &json!({ "aborted": build.id }), || {
                println!("{}", build.id);
                Ok(())
            })
        }
        BuildCommand::Status { id } => {
            let build = remote
                .client
                .inspect_build(remote.project()?, remote.service()?, &id)?;
            emit(ctx, &build, || {
                println!("{}", colorize_status(&build.status));
                Ok(())
            })?;
            ensure_done(&build)
        }
        BuildCommand::Watch { prefix } => {
            let build = latest_build(&remote, prefix.as_deref().unwrap_or_default())?;
            let build = watch(&remote, &build.id)?;
            ensure_done(&build)
        }
        BuildCommand::Push {
            folder,
            skip_deploy,
            watch: follow,
        } => {
            let build = push(ctx, &remote, folder, skip_deploy)?;
            emit(ctx, &build, || {
                println!("{}", build.id);
                Ok(())
            })?;
            if follow {
                let build = watch(&remote, &build.id)?;
                return ensure_done(&build);
            }
            Ok(())
        }
    }
}

fn ensure_done(build: &Build) -> Result<(), ValarError> {
    if status_exit_code(&build.status) == 0 {
        return Ok(());
    }
    Err(ValarError::BuildNotSucceeded {
        id: build.id.clone(),
        status: build.status.clone(),
    })
}

fn list_builds(ctx: &Context, remote: &Remote, prefix: &str) -> Result<(), ValarError> {
    let mut builds = remote
        .client
        .list_builds(remote.project()?, remote.service()?, prefix)?;
    builds.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let rows: Vec<Vec<String>> = builds
        .iter()
        .map(|build| {
            vec![
                build.id.clone(),
                colorize_status(&build.status),
                humanize(build.created_at),
            ]
        })
        .collect();
    emit(ctx, &builds, || {
        print_table(&["ID", "STATUS", "CREATED"], &rows)?;
        Ok(())
    })
}

fn watch(remote: &Remote, id: &str) -> Result<Build, ValarError> {
    let term = Term::stdout();
    let formatter = LogFormatter::for_terminal(&term);
    let mut display = TermWatchDisplay::new(term);
    watch_build(
        &remote.client,
        &mut display,
        &formatter,
        remote.project()?,
        remote.service()?,
        id,
    )
}

fn push_folder(ctx: &Context, folder: Option<PathBuf>) -> PathBuf {
    match folder {
        Some(folder) if folder.is_absolute() => folder,
        Some(folder) => ctx.work_dir.join(folder),
        None => ctx.work_dir.clone(),
    }
}

/// Everything `push` needs that can be checked without the endpoint.
fn check_pushable(target: &ResolvedServiceConfig, folder: &Path) -> Result<(), ValarError> {
    validate_names(target.project()?, target.service()?)?;
    target.build()?;
    target.deployment()?;
    if !folder.is_dir() {
        return Err(ValarError::Validation(format!(
            "expected a directory to push: {}",
            folder.display()
        )));
    }
    Ok(())
}

/// Packs the folder, uploads it as an artifact and submits a build for it.
fn push(
    ctx: &Context,
    remote: &Remote,
    folder: Option<PathBuf>,
    skip_deploy: bool,
) -> Result<Build, ValarError> {
    let project = remote.project()?;
    let service = remote.service()?;
    let build_spec = remote.target.build()?;
    let deployment_spec = remote.target.deployment()?;

    let archive = compress_dir(&push_folder(ctx, folder), &build_spec.ignore)?;
    let artifact = remote
        .client
        .submit_artifact(project, service, archive.reopen()?)?;
    info!(artifact = %artifact.artifact, "uploaded source archive");

    let request = BuildRequest {
        artifact: artifact.artifact,
        build: BuildRequestSpec {
            constructor: build_spec.constructor.clone(),
            environment: kv_pairs(&build_spec.environment),
        },
        deployment: DeploymentRequestSpec {
            skip: skip_deploy || deployment_spec.skip,
            environment: kv_pairs(&deployment_spec.environment),
        },
    };
    remote.client.submit_build(project, service, &request)
}
