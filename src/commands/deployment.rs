use crate::api::{kv_pairs, DeployRequest, RollbackRequest};
use crate::commands::resolve;
use crate::table::{colorize_status, humanize, print_table};
use crate::{emit, Context, DeploymentCommand, ServiceTarget, ValarError};

pub(crate) fn handle_deployment(
    ctx: &Context,
    target: &ServiceTarget,
    command: DeploymentCommand,
) -> Result<(), ValarError> {
    let pending = resolve(ctx, target, true)?;
    if let DeploymentCommand::Create { .. } = &command {
        pending.target.deployment()?;
    }
    let remote = pending.connect(ctx)?;
    let project = remote.project()?;
    let service = remote.service()?;
    match command {
        DeploymentCommand::List => {
            let mut deployments = remote.client.list_deployments(project, service)?;
            deployments.sort_by_key(|deployment| deployment.version);
            let rows: Vec<Vec<String>> = deployments
                .iter()
                .map(|deployment| {
                    vec![
                        deployment.version.to_string(),
                        colorize_status(&deployment.status),
                        deployment.build.clone(),
                        humanize(deployment.created_at),
                    ]
                })
                .collect();
            emit(ctx, &deployments, || {
                print_table(&["VERSION", "STATUS", "BUILD", "CREATED"], &rows)?;
                Ok(())
            })
        }
        DeploymentCommand::Create { build } => {
            let spec = remote.target.deployment()?;
            let request = DeployRequest {
                build: build.unwrap_or_default(),
                environment: kv_pairs(&spec.environment),
            };
            let deployment = remote.client.submit_deploy(project, service, &request)?;
            emit(ctx, &deployment, || {
                println!("{}", deployment.version);
                Ok(())
            })
        }
        DeploymentCommand::Rollback { version } => {
            let deployment =
                remote
                    .client
                    .rollback_deploy(project, service, &RollbackRequest { version })?;
            emit(ctx, &deployment, || {
                println!("{}", deployment.version);
                Ok(())
            })
        }
    }
}
