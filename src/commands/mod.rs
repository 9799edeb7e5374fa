pub(crate) mod auth;
pub(crate) mod build;
pub(crate) mod config;
pub(crate) mod cron;
pub(crate) mod deployment;
pub(crate) mod domain;
pub(crate) mod env;
pub(crate) mod service;

use crate::api::{Build, Client};
use crate::config::CliConfig;
use crate::service::ResolvedServiceConfig;
use crate::{Context, ServiceTarget, ValarError};

/// A connected client together with the service it should act on.
pub(crate) struct Remote {
    pub(crate) client: Client,
    pub(crate) target: ResolvedServiceConfig,
}

impl Remote {
    pub(crate) fn project(&self) -> Result<&str, ValarError> {
        self.target.project()
    }

    pub(crate) fn service(&self) -> Result<&str, ValarError> {
        self.target.service()
    }
}

/// A resolved target that has not touched the network yet.
pub(crate) struct Pending {
    cfg: CliConfig,
    pub(crate) target: ResolvedServiceConfig,
}

impl Pending {
    pub(crate) fn connect(self, ctx: &Context) -> Result<Remote, ValarError> {
        let client = ctx.client(&self.cfg)?;
        Ok(Remote {
            client,
            target: self.target,
        })
    }
}

/// Resolves the target and checks its project, plus its service when
/// `needs_service` is set. Nothing here talks to the endpoint.
pub(crate) fn resolve(
    ctx: &Context,
    target: &ServiceTarget,
    needs_service: bool,
) -> Result<Pending, ValarError> {
    let cfg = ctx.load_remote_config()?;
    let resolved = ctx.resolve_service(&cfg, target.service.as_deref())?;
    resolved.project()?;
    if needs_service {
        resolved.service()?;
    }
    Ok(Pending {
        cfg,
        target: resolved,
    })
}

pub(crate) fn connect(
    ctx: &Context,
    target: &ServiceTarget,
    needs_service: bool,
) -> Result<Remote, ValarError> {
    resolve(ctx, target, needs_service)?.connect(ctx)
}

/// Picks the most recently created build.
pub(crate) fn latest(mut builds: Vec<Build>) -> Option<Build> {
    builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    builds.into_iter().next()
}

pub(crate) fn latest_build(remote: &Remote, prefix: &str) -> Result<Build, ValarError> {
    let builds = remote
        .client
        .list_builds(remote.project()?, remote.service()?, prefix)?;
    latest(builds).ok_or_else(|| {
        if prefix.is_empty() {
            ValarError::Validation("no builds available".to_string())
        } else {
            ValarError::Validation(format!("no builds available matching '{prefix}'"))
        }
    })
}
