use std::io::{self, Write};

use crate::api::KVPair;
use crate::service::{discover, EnvScope, EnvVar, ServiceConfig};
use crate::table::print_table;
use crate::{emit, Context, EnvCommand, ValarError};

const SECRET_PLACEHOLDER: &str = "<secret>";

fn load_descriptor(ctx: &Context) -> Result<ServiceConfig, ValarError> {
    discover(&ctx.service_file, &ctx.work_dir)?.ok_or_else(|| {
        ValarError::Config(format!(
            "no {} found in {} or its parents; create one with `valar service init`",
            ctx.service_file,
            ctx.work_dir.display()
        ))
    })
}

pub(crate) fn handle_env(
    ctx: &Context,
    build: bool,
    format: &str,
    command: Option<EnvCommand>,
) -> Result<(), ValarError> {
    let scope = if build {
        EnvScope::Build
    } else {
        EnvScope::Deployment
    };
    let mut descriptor = load_descriptor(ctx)?;
    match command {
        None => list_env(ctx, &descriptor, scope, format),
        Some(EnvCommand::Set { assignment, secret }) => {
            let mut var = EnvVar::parse_assignment(&assignment)?;
            if secret {
                var = encrypt(ctx, &descriptor, var)?;
            }
            let key = var.key.clone();
            let replaced = descriptor.set_env(scope, var);
            descriptor.write_back()?;
            tracing::debug!(key = %key, replaced, "environment updated");
            emit(ctx, &serde_json::json!({ "key": key, "replaced": replaced }), || Ok(()))
        }
        Some(EnvCommand::Delete { key }) => {
            descriptor.delete_env(scope, &key)?;
            descriptor.write_back()?;
            emit(ctx, &serde_json::json!({ "deleted": key }), || Ok(()))
        }
    }
}

fn encrypt(ctx: &Context, descriptor: &ServiceConfig, var: EnvVar) -> Result<EnvVar, ValarError> {
    let cfg = ctx.load_remote_config()?;
    let client = ctx.client(&cfg)?;
    let project = if descriptor.project.is_empty() {
        cfg.project()?.to_string()
    } else {
        descriptor.project.clone()
    };
    let pair = KVPair {
        secret: true,
        ..KVPair::from(&var)
    };
    let mut encrypted: EnvVar = client.encrypt_environment(&project, &pair)?.into();
    encrypted.secret = true;
    Ok(encrypted)
}

fn display_value(var: &EnvVar) -> &str {
    if var.secret {
        SECRET_PLACEHOLDER
    } else {
        &var.value
    }
}

fn list_env(
    ctx: &Context,
    descriptor: &ServiceConfig,
    scope: EnvScope,
    format: &str,
) -> Result<(), ValarError> {
    let vars = descriptor.environment(scope);
    emit(ctx, &vars, || match format {
        "raw" => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for var in vars {
                writeln!(out, "{}={}", var.key, display_value(var))?;
            }
            Ok(())
        }
        "table" => {
            let rows: Vec<Vec<String>> = vars
                .iter()
                .map(|var| {
                    vec![
                        var.key.clone(),
                        display_value(var).to_string(),
                        var.secret.to_string(),
                    ]
                })
                .collect();
            print_table(&["KEY", "VALUE", "SECRET"], &rows)?;
            Ok(())
        }
        other => Err(ValarError::Validation(format!("unknown env format {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const DESCRIPTOR: &str = "env-test-descriptor.yml";

    fn setup() -> (tempfile::TempDir, Context) {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(DESCRIPTOR),
            "project: demo\nservice: api\nbuild:\n  constructor: go\ndeployment:\n  environment:\n    - A=1\n    - B=2\n",
        )
        .unwrap();
        let nested = dir.path().join("src");
        fs::create_dir_all(&nested).unwrap();
        let ctx = Context {
            config_paths: vec![dir.path().join("config")],
            service_file: DESCRIPTOR.to_string(),
            work_dir: nested,
            json: true,
        };
        (dir, ctx)
    }

    fn reload(dir: &tempfile::TempDir) -> ServiceConfig {
        ServiceConfig::from_file(&dir.path().join(DESCRIPTOR)).unwrap()
    }

    #[test]
    fn set_replaces_and_appends_in_discovered_descriptor() {
        let (dir, ctx) = setup();
        let set = |assignment: &str, build: bool| {
            handle_env(
                &ctx,
                build,
                "table",
                Some(EnvCommand::Set {
                    assignment: assignment.to_string(),
                    secret: false,
                }),
            )
        };
        set("A=one=1", false).unwrap();
        set("C=3", false).unwrap();
        set("GOFLAGS=-mod=vendor", true).unwrap();

        let cfg = reload(&dir);
        let deploy: Vec<String> = cfg
            .environment(EnvScope::Deployment)
            .iter()
            .map(|var| var.to_string())
            .collect();
        assert_eq!(deploy, vec!["A=one=1", "B=2", "C=3"]);
        assert_eq!(cfg.environment(EnvScope::Build)[0].value, "-mod=vendor");
    }

    #[test]
    fn delete_removes_one_entry() {
        let (dir, ctx) = setup();
        handle_env(
            &ctx,
            false,
            "table",
            Some(EnvCommand::Delete {
                key: "A".to_string(),
            }),
        )
        .unwrap();
        let cfg = reload(&dir);
        assert_eq!(cfg.environment(EnvScope::Deployment).len(), 1);
        assert_eq!(cfg.environment(EnvScope::Deployment)[0].key, "B");

        let err = handle_env(
            &ctx,
            false,
            "table",
            Some(EnvCommand::Delete {
                key: "A".to_string(),
            }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn malformed_assignment_leaves_file_untouched() {
        let (dir, ctx) = setup();
        let before = fs::read_to_string(dir.path().join(DESCRIPTOR)).unwrap();
        let result = handle_env(
            &ctx,
            false,
            "table",
            Some(EnvCommand::Set {
                assignment: "NOVALUE".to_string(),
                secret: false,
            }),
        );
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(dir.path().join(DESCRIPTOR)).unwrap(), before);
    }

    #[test]
    fn secrets_are_hidden_in_listings() {
        let var = EnvVar {
            key: "TOKEN".to_string(),
            value: "ciphertext".to_string(),
            secret: true,
        };
        assert_eq!(display_value(&var), SECRET_PLACEHOLDER);
    }

    #[test]
    fn missing_descriptor_is_reported() {
        let dir = tempdir().unwrap();
        let ctx = Context {
            config_paths: vec![dir.path().join("config")],
            service_file: "no-such-descriptor-anywhere.yml".to_string(),
            work_dir: dir.path().to_path_buf(),
            json: true,
        };
        let err = handle_env(&ctx, false, "table", None).unwrap_err();
        assert!(err.to_string().contains("valar service init"));
    }
}
