use serde_json::json;

use crate::commands::connect;
use crate::permission::{Permission, PermissionPath, PermissionState};
use crate::table::{colorize_status, print_table};
use crate::{emit, AuthCommand, Context, ServiceTarget, ValarError};

/// Splits an optional listing path into the namespace and item prefix the server filters on.
fn listing_filter(path: Option<&str>) -> Result<(String, String), ValarError> {
    match path {
        None => Ok((String::new(), String::new())),
        Some(raw) => {
            let path: PermissionPath = raw.parse()?;
            Ok((path.namespace, path.items.join("/")))
        }
    }
}

fn modify(ctx: &Context, permission: Permission) -> Result<(), ValarError> {
    let remote = connect(ctx, &ServiceTarget::default(), false)?;
    let modified = remote
        .client
        .modify_permission(remote.project()?, &permission)?;
    tracing::debug!(path = %permission.path, modified, "permission updated");
    emit(
        ctx,
        &json!({ "permission": permission, "modified": modified }),
        || {
            if !modified {
                println!("No change");
            }
            Ok(())
        },
    )
}

pub(crate) fn handle_auth(ctx: &Context, command: AuthCommand) -> Result<(), ValarError> {
    match command {
        AuthCommand::List { path } => {
            let (namespace, prefix) = listing_filter(path.as_deref())?;
            let remote = connect(ctx, &ServiceTarget::default(), false)?;
            let permissions = remote
                .client
                .list_permissions(remote.project()?, &namespace, &prefix)?;
            let rows: Vec<Vec<String>> = permissions
                .iter()
                .map(|permission| {
                    vec![
                        permission.path.to_string(),
                        permission.user.to_string(),
                        permission.action.clone(),
                        colorize_status(&permission.state),
                    ]
                })
                .collect();
            emit(ctx, &permissions, || {
                print_table(&["PATH", "USER", "ACTION", "STATE"], &rows)?;
                Ok(())
            })
        }
        AuthCommand::Check { path, user, action } => {
            let permission = Permission::parse(&path, &user, &action, None)?;
            let remote = connect(ctx, &ServiceTarget::default(), false)?;
            let allowed = remote
                .client
                .check_permission(remote.project()?, &permission)?;
            emit(ctx, &json!({ "allowed": allowed }), || {
                println!("{}", if allowed { "allowed" } else { "denied" });
                Ok(())
            })
        }
        AuthCommand::Allow { path, user, action } => modify(
            ctx,
            Permission::parse(&path, &user, &action, Some(PermissionState::Allow))?,
        ),
        AuthCommand::Deny { path, user, action } => modify(
            ctx,
            Permission::parse(&path, &user, &action, Some(PermissionState::Deny))?,
        ),
        AuthCommand::Reset { path, user, action } => modify(
            ctx,
            Permission::parse(&path, &user, &action, Some(PermissionState::Unset))?,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offline_context() -> (tempfile::TempDir, Context) {
        let dir = tempdir().unwrap();
        let ctx = Context {
            config_paths: vec![dir.path().join("missing-config")],
            service_file: "no-descriptor.yml".to_string(),
            work_dir: dir.path().to_path_buf(),
            json: true,
        };
        (dir, ctx)
    }

    #[test]
    fn malformed_user_fails_before_connecting() {
        let (_dir, ctx) = offline_context();
        let err = handle_auth(
            &ctx,
            AuthCommand::Allow {
                path: "service:demo".to_string(),
                user: "alice".to_string(),
                action: "invoke".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, ValarError::Validation(_)));
        assert!(err.to_string().contains("invalid permission user: alice"));
    }

    #[test]
    fn malformed_path_fails_before_connecting() {
        let (_dir, ctx) = offline_context();
        let err = handle_auth(
            &ctx,
            AuthCommand::Check {
                path: "nocolon".to_string(),
                user: "user:alice".to_string(),
                action: "invoke".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid permission path: nocolon"));
    }

    #[test]
    fn listing_filter_splits_namespace_from_prefix() {
        assert_eq!(
            listing_filter(Some("service:demo/api")).unwrap(),
            ("service".to_string(), "demo/api".to_string())
        );
        assert_eq!(
            listing_filter(None).unwrap(),
            (String::new(), String::new())
        );
        assert!(listing_filter(Some("nocolon")).is_err());
    }
}
