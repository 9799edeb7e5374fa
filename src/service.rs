//! Service descriptor (`.valar.yml`) handling and service resolution.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::{write_atomic_text_file, CliConfig};
use crate::ValarError;

pub(crate) const DEFAULT_SERVICE_FILE: &str = ".valar.yml";
const DESCRIPTOR_MODE: u32 = 0o644;

/// One environment variable of a build or deployment scope.
///
/// Plain variables are stored in the compact `KEY=VALUE` form, secrets and
/// keys containing `=` as a mapping. Both forms are accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "EnvVarRepr", into = "EnvVarRepr")]
pub(crate) struct EnvVar {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) secret: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum EnvVarRepr {
    Compact(String),
    Structured {
        key: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        value: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        secret: bool,
    },
}

impl TryFrom<EnvVarRepr> for EnvVar {
    type Error = String;

    fn try_from(repr: EnvVarRepr) -> Result<Self, Self::Error> {
        let var = match repr {
            EnvVarRepr::Compact(raw) => {
                EnvVar::parse_assignment(&raw).map_err(|err| err.to_string())?
            }
            EnvVarRepr::Structured { key, value, secret } => EnvVar { key, value, secret },
        };
        if var.key.is_empty() {
            return Err("environment variable key must not be empty".to_string());
        }
        Ok(var)
    }
}

impl From<EnvVar> for EnvVarRepr {
    fn from(var: EnvVar) -> Self {
        // the compact form splits on the first `=`
        if var.secret || var.key.contains('=') {
            EnvVarRepr::Structured {
                key: var.key,
                value: var.value,
                secret: var.secret,
            }
        } else {
            EnvVarRepr::Compact(format!("{}={}", var.key, var.value))
        }
    }
}

impl EnvVar {
    /// Parses `KEY=VALUE`, splitting on the first `=` only.
    pub(crate) fn parse_assignment(raw: &str) -> Result<Self, ValarError> {
        match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(EnvVar {
                key: key.to_string(),
                value: value.to_string(),
                secret: false,
            }),
            _ => Err(ValarError::Validation(format!(
                "environment variable '{raw}' has to be KEY=VALUE"
            ))),
        }
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct BuildSpec {
    #[serde(default)]
    pub(crate) constructor: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub(crate) ignore: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub(crate) environment: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct DeploymentSpec {
    #[serde(default)]
    pub(crate) skip: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub(crate) environment: Vec<EnvVar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnvScope {
    Build,
    Deployment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct ServiceConfig {
    #[serde(default)]
    pub(crate) project: String,
    #[serde(default)]
    pub(crate) service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) build: Option<BuildSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) deployment: Option<DeploymentSpec>,
    #[serde(skip)]
    pub(crate) path: PathBuf,
}

impl ServiceConfig {
    pub(crate) fn from_file(path: &Path) -> Result<Self, ValarError> {
        let content = fs::read_to_string(path)?;
        let mut cfg: ServiceConfig = if content.trim().is_empty() {
            ServiceConfig::default()
        } else {
            serde_yaml::from_str(&content).map_err(|err| {
                ValarError::Config(format!(
                    "invalid service descriptor {}: {}",
                    path.display(),
                    err
                ))
            })?
        };
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    /// A fresh descriptor for `service init`.
    pub(crate) fn scaffold(path: PathBuf, project: &str, service: &str, constructor: &str) -> Self {
        ServiceConfig {
            project: project.to_string(),
            service: service.to_string(),
            build: Some(BuildSpec {
                constructor: constructor.to_string(),
                ..BuildSpec::default()
            }),
            deployment: Some(DeploymentSpec::default()),
            path,
        }
    }

    pub(crate) fn write_back(&self) -> Result<(), ValarError> {
        let content = serde_yaml::to_string(self)?;
        write_atomic_text_file(&self.path, &content, DESCRIPTOR_MODE)
    }

    pub(crate) fn environment(&self, scope: EnvScope) -> &[EnvVar] {
        match scope {
            EnvScope::Build => self
                .build
                .as_ref()
                .map(|build| build.environment.as_slice())
                .unwrap_or_default(),
            EnvScope::Deployment => self
                .deployment
                .as_ref()
                .map(|deployment| deployment.environment.as_slice())
                .unwrap_or_default(),
        }
    }

    fn environment_mut(&mut self, scope: EnvScope) -> &mut Vec<EnvVar> {
        match scope {
            EnvScope::Build => &mut self.build.get_or_insert_with(BuildSpec::default).environment,
            EnvScope::Deployment => {
                &mut self
                    .deployment
                    .get_or_insert_with(DeploymentSpec::default)
                    .environment
            }
        }
    }

    /// Replaces the variable with the same key in place, or appends it.
    /// Returns whether an existing entry was replaced.
    pub(crate) fn set_env(&mut self, scope: EnvScope, var: EnvVar) -> bool {
        let vars = self.environment_mut(scope);
        match vars.iter_mut().find(|existing| existing.key == var.key) {
            Some(existing) => {
                *existing = var;
                true
            }
            None => {
                vars.push(var);
                false
            }
        }
    }

    /// Removes the variable named `key`, keeping the order of the others.
    pub(crate) fn delete_env(&mut self, scope: EnvScope, key: &str) -> Result<EnvVar, ValarError> {
        let vars = self.environment_mut(scope);
        let index = vars
            .iter()
            .position(|var| var.key == key)
            .ok_or_else(|| {
                ValarError::Validation(format!("environment variable {key} not found"))
            })?;
        Ok(vars.remove(index))
    }
}

/// Looks for `filename` in `start_dir` and each of its ancestors.
pub(crate) fn discover(
    filename: &str,
    start_dir: &Path,
) -> Result<Option<ServiceConfig>, ValarError> {
    let mut current = if start_dir.is_absolute() {
        start_dir.to_path_buf()
    } else {
        std::env::current_dir()?.join(start_dir)
    };
    loop {
        let candidate = current.join(filename);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "found service descriptor");
            return ServiceConfig::from_file(&candidate).map(Some);
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => return Ok(None),
        }
    }
}

/// Service settings after merging the descriptor, the `--service` flag and the CLI config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResolvedServiceConfig {
    project: String,
    service: String,
    build: Option<BuildSpec>,
    deployment: Option<DeploymentSpec>,
}

impl ResolvedServiceConfig {
    pub(crate) fn project(&self) -> Result<&str, ValarError> {
        if self.project.is_empty() {
            return Err(ValarError::Config(
                "operation requires service project".to_string(),
            ));
        }
        Ok(&self.project)
    }

    pub(crate) fn service(&self) -> Result<&str, ValarError> {
        if self.service.is_empty() {
            return Err(ValarError::Config(
                "operation requires service reference (may be specified using --service)"
                    .to_string(),
            ));
        }
        Ok(&self.service)
    }

    pub(crate) fn build(&self) -> Result<&BuildSpec, ValarError> {
        self.build.as_ref().ok_or_else(|| {
            ValarError::Config("operation requires build specification".to_string())
        })
    }

    pub(crate) fn deployment(&self) -> Result<&DeploymentSpec, ValarError> {
        self.deployment.as_ref().ok_or_else(|| {
            ValarError::Config("operation requires deployment specification".to_string())
        })
    }
}

impl From<ServiceConfig> for ResolvedServiceConfig {
    fn from(cfg: ServiceConfig) -> Self {
        ResolvedServiceConfig {
            project: cfg.project,
            service: cfg.service,
            build: cfg.build,
            deployment: cfg.deployment,
        }
    }
}

/// Resolves the target service.
///
/// Without a descriptor the project comes from the active context and the
/// service from `service_override`. With a descriptor and an override naming a
/// different service, only the descriptor's project is kept since its build and
/// deployment sections describe another service.
pub(crate) fn resolve_with_fallback(
    filename: &str,
    start_dir: &Path,
    service_override: Option<&str>,
    cli_config: &CliConfig,
) -> Result<ResolvedServiceConfig, ValarError> {
    let service_override = service_override.filter(|service| !service.is_empty());
    match discover(filename, start_dir)? {
        None => Ok(ResolvedServiceConfig {
            project: cli_config.project()?.to_string(),
            service: service_override.unwrap_or_default().to_string(),
            ..ResolvedServiceConfig::default()
        }),
        Some(file) => match service_override {
            Some(service) if service != file.service => Ok(ResolvedServiceConfig {
                project: file.project,
                service: service.to_string(),
                ..ResolvedServiceConfig::default()
            }),
            _ => Ok(file.into()),
        },
    }
}

/// Checks project and service names before they reach the server.
pub(crate) fn validate_names(project: &str, service: &str) -> Result<(), ValarError> {
    if !is_valid_project_name(project) {
        return Err(ValarError::Validation(format!(
            "invalid project name '{project}': may only contain alphanumerics and dashes"
        )));
    }
    if !is_valid_service_name(service) {
        return Err(ValarError::Validation(format!(
            "invalid service name '{service}': may only contain alphanumerics"
        )));
    }
    Ok(())
}

// letters first, then alphanumerics with single inner dashes
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    let mut previous_dash = false;
    for c in chars {
        match c {
            '-' if previous_dash => return false,
            '-' => previous_dash = true,
            c if c.is_ascii_alphanumeric() => previous_dash = false,
            _ => return false,
        }
    }
    !previous_dash
}

fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;
    use tempfile::tempdir;

    const DESCRIPTOR: &str = "test-descriptor.yml";

    fn cli_config(project: &str) -> CliConfig {
        let mut cfg = CliConfig::default();
        cfg.set_endpoint("prod", Some("https://api.x".to_string()), Some("t".to_string()));
        cfg.set_context("default", Some("prod".to_string()), Some(project.to_string()));
        cfg.use_context("default").unwrap();
        cfg
    }

    fn descriptor() -> &'static str {
        "project: p1\nservice: s1\nbuild:\n  constructor: python\n  ignore: [target]\n  environment:\n    - A=1\n    - key: TOKEN\n      value: enc\n      secret: true\ndeployment:\n  skip: false\n  environment: []\n"
    }

    #[test]
    fn env_var_decodes_both_forms() {
        let vars: Vec<EnvVar> =
            serde_yaml::from_str("- A=b=c\n- key: S\n  value: x\n  secret: true\n- key: P\n")
                .unwrap();
        assert_eq!(vars[0].key, "A");
        assert_eq!(vars[0].value, "b=c");
        assert!(!vars[0].secret);
        assert!(vars[1].secret);
        assert_eq!(vars[2].value, "");
    }

    #[test]
    fn env_var_encodes_compact_unless_secret() {
        let vars = vec![
            EnvVar {
                key: "A".to_string(),
                value: "1".to_string(),
                secret: false,
            },
            EnvVar {
                key: "S".to_string(),
                value: "x".to_string(),
                secret: true,
            },
        ];
        let yaml = serde_yaml::to_string(&vars).unwrap();
        assert!(yaml.contains("- A=1"));
        assert!(yaml.contains("secret: true"));
        let decoded: Vec<EnvVar> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded, vars);
    }

    #[test]
    fn key_with_equals_sign_survives_rewrite() {
        let var = EnvVar {
            key: "A=B".to_string(),
            value: "c".to_string(),
            secret: false,
        };
        let yaml = serde_yaml::to_string(&var).unwrap();
        assert!(yaml.contains("key: A=B"), "{yaml}");
        assert!(!yaml.contains("secret"));
        let decoded: EnvVar = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded, var);
    }

    #[test]
    fn env_var_rejects_missing_equals() {
        assert!(serde_yaml::from_str::<EnvVar>("NOEQUALS").is_err());
        assert!(serde_yaml::from_str::<EnvVar>("=value").is_err());
        assert!(EnvVar::parse_assignment("KEY").is_err());
    }

    #[test]
    fn discover_walks_up_to_ancestor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), descriptor()).unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let found = discover(DESCRIPTOR, &nested).unwrap().expect("descriptor");
        assert_eq!(found.project, "p1");
        assert_eq!(found.path, dir.path().join(DESCRIPTOR));
        assert_eq!(found.build.unwrap().environment.len(), 2);
    }

    #[test]
    fn discover_returns_none_at_root() {
        let dir = tempdir().unwrap();
        let found = discover("valar-descriptor-that-does-not-exist.yml", dir.path()).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn discover_fails_on_malformed_descriptor() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), "project: [broken\n").unwrap();
        assert!(discover(DESCRIPTOR, dir.path()).is_err());
    }

    #[test]
    fn null_lists_decode_as_empty() {
        let cfg: ServiceConfig =
            serde_yaml::from_str("project: p\nservice: s\nbuild:\n  constructor: go\n  ignore:\n  environment:\n")
                .unwrap();
        let build = cfg.build.unwrap();
        assert!(build.ignore.is_empty());
        assert!(build.environment.is_empty());
    }

    #[test]
    fn fallback_uses_context_project_without_descriptor() {
        let dir = tempdir().unwrap();
        let resolved =
            resolve_with_fallback("no-such-descriptor.yml", dir.path(), Some("api"), &cli_config("demo"))
                .unwrap();
        assert_eq!(resolved.project().unwrap(), "demo");
        assert_eq!(resolved.service().unwrap(), "api");
        assert!(resolved.build().is_err());
    }

    #[test]
    fn fallback_without_service_fails_on_access() {
        let dir = tempdir().unwrap();
        let resolved =
            resolve_with_fallback("no-such-descriptor.yml", dir.path(), None, &cli_config("demo"))
                .unwrap();
        let err = resolved.service().expect_err("service must be missing");
        assert!(err.to_string().contains("--service"));
    }

    #[test]
    fn fallback_requires_context_project() {
        let dir = tempdir().unwrap();
        let result =
            resolve_with_fallback("no-such-descriptor.yml", dir.path(), None, &CliConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn override_keeps_descriptor_project_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), descriptor()).unwrap();

        let resolved =
            resolve_with_fallback(DESCRIPTOR, dir.path(), Some("other"), &cli_config("demo")).unwrap();
        assert_eq!(resolved.project().unwrap(), "p1");
        assert_eq!(resolved.service().unwrap(), "other");
        let err = resolved.deployment().expect_err("deployment dropped");
        assert!(err.to_string().contains("deployment specification"));
    }

    #[test]
    fn descriptor_used_verbatim_without_override() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DESCRIPTOR), descriptor()).unwrap();

        let resolved =
            resolve_with_fallback(DESCRIPTOR, dir.path(), Some(""), &cli_config("demo")).unwrap();
        assert_eq!(resolved.service().unwrap(), "s1");
        assert_eq!(resolved.build().unwrap().constructor, "python");
        assert!(resolved.deployment().is_ok());
    }

    #[test]
    fn set_env_replaces_in_place_and_appends() {
        let mut cfg = ServiceConfig::default();
        let a = EnvVar::parse_assignment("A=1").unwrap();
        let b = EnvVar::parse_assignment("B=2").unwrap();
        assert!(!cfg.set_env(EnvScope::Deployment, a));
        assert!(!cfg.set_env(EnvScope::Deployment, b));
        assert!(cfg.set_env(EnvScope::Deployment, EnvVar::parse_assignment("A=3").unwrap()));

        let vars = cfg.environment(EnvScope::Deployment);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].to_string(), "A=3");
        assert!(cfg.environment(EnvScope::Build).is_empty());
    }

    #[test]
    fn delete_env_keeps_order_of_remaining() {
        let mut cfg = ServiceConfig::default();
        for raw in ["A=1", "B=2", "C=3"] {
            cfg.set_env(EnvScope::Build, EnvVar::parse_assignment(raw).unwrap());
        }
        let removed = cfg.delete_env(EnvScope::Build, "A").unwrap();
        assert_eq!(removed.value, "1");
        let keys: Vec<_> = cfg
            .environment(EnvScope::Build)
            .iter()
            .map(|var| var.key.as_str())
            .collect();
        assert_eq!(keys, vec!["B", "C"]);

        let err = cfg.delete_env(EnvScope::Build, "A").expect_err("already gone");
        assert!(err.to_string().contains("A not found"));
    }

    #[test]
    fn write_back_round_trips_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DESCRIPTOR);
        fs::write(&path, descriptor()).unwrap();
        let mut cfg = ServiceConfig::from_file(&path).unwrap();
        cfg.set_env(EnvScope::Deployment, EnvVar::parse_assignment("X=y").unwrap());
        cfg.write_back().unwrap();

        let reloaded = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(reloaded, cfg);
    }

    #[test]
    fn project_names_follow_dash_rules() {
        for ok in ["demo", "my-proj", "a1-b2", "Abc"] {
            assert!(is_valid_project_name(ok), "{ok}");
        }
        for bad in ["", "1abc", "-abc", "abc-", "a--b", "a_b"] {
            assert!(!is_valid_project_name(bad), "{bad}");
        }
    }

    #[test]
    fn service_names_are_alphanumeric() {
        assert!(validate_names("demo", "api2").is_ok());
        assert!(validate_names("demo", "api-2").is_err());
        assert!(validate_names("demo", "2api").is_err());
        assert!(validate_names("-demo", "api").is_err());
    }
}
