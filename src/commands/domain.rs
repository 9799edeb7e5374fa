use serde_json::json;

use crate::commands::connect;
use crate::table::print_table;
use crate::{emit, Context, DomainCommand, ServiceTarget, ValarError};

pub(crate) fn handle_domain(ctx: &Context, command: DomainCommand) -> Result<(), ValarError> {
    let (target, needs_service) = match &command {
        DomainCommand::Link { target, .. } | DomainCommand::Unlink { target, .. } => {
            (target.clone(), true)
        }
        _ => (ServiceTarget::default(), false),
    };
    let remote = connect(ctx, &target, needs_service)?;
    let project = remote.project()?;
    match command {
        DomainCommand::List => {
            let mut domains = remote.client.list_domains(project)?;
            domains.sort_by(|a, b| a.domain.cmp(&b.domain));
            let rows: Vec<Vec<String>> = domains
                .iter()
                .map(|domain| {
                    vec![
                        domain.domain.clone(),
                        domain.verified.to_string(),
                        domain
                            .service
                            .clone()
                            .unwrap_or_else(|| "<none>".to_string()),
                        domain.error.clone(),
                    ]
                })
                .collect();
            emit(ctx, &domains, || {
                print_table(&["DOMAIN", "VERIFIED", "SERVICE", "ERROR"], &rows)?;
                Ok(())
            })
        }
        DomainCommand::Add { domain } => {
            let records = remote.client.add_domain(project, &domain)?;
            emit(ctx, &records, || {
                println!("Please set the following records (choose one for A/AAAA and CNAME):");
                println!();
                let rows: Vec<Vec<String>> = records
                    .iter()
                    .map(|(kind, value)| vec![kind.clone(), value.clone()])
                    .collect();
                print_table(&["TYPE", "RECORD"], &rows)?;
                Ok(())
            })
        }
        DomainCommand::Delete { domain } => {
            remote.client.delete_domain(project, &domain)?;
            emit(ctx, &json!({ "deleted": domain }), || Ok(()))
        }
        DomainCommand::Verify { domain } => {
            let verified = remote.client.verify_domain(project, &domain)?;
            emit(ctx, &verified, || {
                println!("Verified until {}", verified.expiration.to_rfc3339());
                Ok(())
            })
        }
        DomainCommand::Link {
            domain, insecure, ..
        } => {
            let service = remote.service()?;
            remote
                .client
                .link_domain(project, &domain, service, insecure)?;
            emit(
                ctx,
                &json!({ "domain": domain, "service": service, "allowInsecureTraffic": insecure }),
                || Ok(()),
            )
        }
        DomainCommand::Unlink { domain, .. } => {
            let service = remote.service()?;
            remote.client.unlink_domain(project, &domain, service)?;
            emit(ctx, &json!({ "domain": domain, "unlinked": service }), || Ok(()))
        }
    }
}
