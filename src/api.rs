//! Blocking client for the platform REST API.

use chrono::{DateTime, Utc};
use reqwest::blocking::{Body, Client as HttpClient, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::logs::BuildLogSource;
use crate::permission::Permission;
use crate::service::{null_as_default, EnvVar};
use crate::ValarError;

const API_VERSION: &str = "v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// An error reported by the server, carrying the `error` field of the response body.
#[derive(Debug, Error)]
#[error("{}: {message}", .status.canonical_reason().unwrap_or("Unknown Status"))]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl ApiError {
    pub(crate) fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct UserInfo {
    pub(crate) name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub(crate) projects: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Service {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) deployed_at: DateTime<Utc>,
    #[serde(deserialize_with = "null_as_default")]
    pub(crate) domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Build {
    pub(crate) id: String,
    pub(crate) constructor: String,
    pub(crate) status: String,
    pub(crate) error: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) flags: String,
    pub(crate) owner: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Deployment {
    pub(crate) version: i64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) error: String,
    pub(crate) status: String,
    pub(crate) build: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct Domain {
    pub(crate) project: String,
    pub(crate) domain: String,
    pub(crate) token: String,
    pub(crate) verified: bool,
    pub(crate) expiration: DateTime<Utc>,
    pub(crate) error: String,
    pub(crate) service: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct Schedule {
    pub(crate) name: String,
    pub(crate) timespec: String,
    pub(crate) path: String,
    pub(crate) payload: String,
    pub(crate) status: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct ScheduleDetails {
    pub(crate) invocation: Option<ServiceInvocation>,
    pub(crate) schedule: Option<Schedule>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct ServiceInvocation {
    pub(crate) id: String,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) status: String,
    pub(crate) triggered_by: String,
}

/// Wire form of an environment variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct KVPair {
    pub(crate) key: String,
    pub(crate) value: String,
    pub(crate) secret: bool,
}

impl From<&EnvVar> for KVPair {
    fn from(var: &EnvVar) -> Self {
        KVPair {
            key: var.key.clone(),
            value: var.value.clone(),
            secret: var.secret,
        }
    }
}

impl From<KVPair> for EnvVar {
    fn from(pair: KVPair) -> Self {
        EnvVar {
            key: pair.key,
            value: pair.value,
            secret: pair.secret,
        }
    }
}

pub(crate) fn kv_pairs(vars: &[EnvVar]) -> Vec<KVPair> {
    vars.iter().map(KVPair::from).collect()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub(crate) struct Artifact {
    pub(crate) artifact: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct BuildRequest {
    pub(crate) artifact: String,
    pub(crate) build: BuildRequestSpec,
    pub(crate) deployment: DeploymentRequestSpec,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct BuildRequestSpec {
    pub(crate) constructor: String,
    pub(crate) environment: Vec<KVPair>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct DeploymentRequestSpec {
    pub(crate) skip: bool,
    pub(crate) environment: Vec<KVPair>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct DeployRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub(crate) build: String,
    pub(crate) environment: Vec<KVPair>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RollbackRequest {
    pub(crate) version: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogSource {
    Wrapper,
    Process,
    #[default]
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogStage {
    Setup,
    Turndown,
    #[default]
    #[serde(other)]
    Unspecified,
}

/// One record of a build or service log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct LogEntry {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) source: LogSource,
    pub(crate) stage: LogStage,
    pub(crate) content: String,
}

pub(crate) type LogConsumer<'a> = dyn FnMut(LogEntry) -> Result<(), ValarError> + 'a;

/// Decodes newline-delimited `LogEntry` records, handing each one to
/// `consumer` before the next line is read.
pub(crate) fn read_log_stream<R: BufRead>(
    reader: R,
    consumer: &mut LogConsumer<'_>,
) -> Result<(), ValarError> {
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: LogEntry = serde_json::from_str(line)?;
        consumer(entry)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Modified {
    modified: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Allowed {
    allowed: bool,
}

pub(crate) struct Client {
    endpoint: String,
    token: String,
    http: HttpClient,
    streaming: HttpClient,
}

fn request_error(context: &str) -> impl FnOnce(reqwest::Error) -> ValarError + '_ {
    move |source| ValarError::Request {
        context: context.to_string(),
        source,
    }
}

impl Client {
    pub(crate) fn new(endpoint: &str, token: &str) -> Result<Self, ValarError> {
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(request_error("building HTTP client"))?;
        let streaming = HttpClient::builder()
            .timeout(None)
            .build()
            .map_err(request_error("building HTTP client"))?;
        Ok(Client {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            streaming,
        })
    }

    /// Creates a client and makes sure the endpoint speaks the expected API version.
    pub(crate) fn connect(endpoint: &str, token: &str) -> Result<Self, ValarError> {
        let client = Client::new(endpoint, token)?;
        client.check()?;
        Ok(client)
    }

    fn check(&self) -> Result<(), ValarError> {
        let info: VersionInfo = self.call(Method::GET, "/", |req| req)?;
        if info.version != API_VERSION {
            return Err(ValarError::Config(format!(
                "client requires endpoint {API_VERSION}, {} speaks '{}'",
                self.endpoint, info.version
            )));
        }
        Ok(())
    }

    fn send(
        &self,
        http: &HttpClient,
        method: Method,
        path: &str,
        prepare: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, ValarError> {
        let context = format!("{method} {path}");
        debug!(%method, path, "api request");
        let request = http
            .request(method, format!("{}{}", self.endpoint, path))
            .bearer_auth(&self.token);
        let response = prepare(request)
            .send()
            .map_err(request_error(&context))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).into())
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        prepare: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<T, ValarError> {
        let context = format!("decoding {method} {path}");
        let response = self.send(&self.http, method, path, prepare)?;
        response.json().map_err(request_error(&context))
    }

    fn call_unit(
        &self,
        method: Method,
        path: &str,
        prepare: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<(), ValarError> {
        self.send(&self.http, method, path, prepare).map(drop)
    }

    fn call_list<T: DeserializeOwned>(
        &self,
        path: &str,
        prepare: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Vec<T>, ValarError> {
        let items: Option<Vec<T>> = self.call(Method::GET, path, prepare)?;
        Ok(items.unwrap_or_default())
    }

    fn stream_logs(
        &self,
        path: &str,
        query: &[(&str, String)],
        consumer: &mut LogConsumer<'_>,
    ) -> Result<(), ValarError> {
        let response = self.send(&self.streaming, Method::GET, path, |req| req.query(query))?;
        read_log_stream(BufReader::new(response), consumer)
    }

    pub(crate) fn user_info(&self) -> Result<UserInfo, ValarError> {
        self.call(Method::GET, "/users/info", |req| req)
    }

    pub(crate) fn list_services(&self, project: &str, prefix: &str) -> Result<Vec<Service>, ValarError> {
        self.call_list(&format!("/projects/{project}/services/{prefix}"), |req| req)
    }

    pub(crate) fn stream_service_logs(
        &self,
        project: &str,
        service: &str,
        follow: bool,
        tail: bool,
        skip: u64,
        consumer: &mut LogConsumer<'_>,
    ) -> Result<(), ValarError> {
        let mut query = Vec::new();
        if follow {
            query.push(("follow", "true".to_string()));
        }
        query.push(("seek", if tail { "end" } else { "start" }.to_string()));
        query.push(("skip", skip.to_string()));
        self.stream_logs(
            &format!("/projects/{project}/services/{service}/logs"),
            &query,
            consumer,
        )
    }

    /// Uploads a source archive. The upload is not bound by the request timeout.
    pub(crate) fn submit_artifact(
        &self,
        project: &str,
        service: &str,
        archive: File,
    ) -> Result<Artifact, ValarError> {
        let path = format!("/projects/{project}/services/{service}/artifacts");
        let context = format!("decoding POST {path}");
        let response = self.send(&self.streaming, Method::POST, &path, |req| {
            req.body(Body::from(archive))
        })?;
        response.json().map_err(request_error(&context))
    }

    pub(crate) fn submit_build(
        &self,
        project: &str,
        service: &str,
        request: &BuildRequest,
    ) -> Result<Build, ValarError> {
        self.call(
            Method::POST,
            &format!("/projects/{project}/services/{service}/builds"),
            |req| req.json(request),
        )
    }

    pub(crate) fn abort_build(&self, project: &str, service: &str, id: &str) -> Result<(), ValarError> {
        self.call_unit(
            Method::POST,
            &format!("/projects/{project}/services/{service}/builds/{id}/abort"),
            |req| req,
        )
    }

    pub(crate) fn list_builds(
        &self,
        project: &str,
        service: &str,
        prefix: &str,
    ) -> Result<Vec<Build>, ValarError> {
        self.call_list(
            &format!("/projects/{project}/services/{service}/builds/{prefix}"),
            |req| req,
        )
    }

    pub(crate) fn inspect_build(&self, project: &str, service: &str, id: &str) -> Result<Build, ValarError> {
        self.call(
            Method::GET,
            &format!("/projects/{project}/services/{service}/builds/{id}/inspect"),
            |req| req,
        )
    }

    pub(crate) fn build_logs(
        &self,
        project: &str,
        service: &str,
        id: &str,
        follow: bool,
        consumer: &mut LogConsumer<'_>,
    ) -> Result<(), ValarError> {
        let query = if follow {
            vec![("follow", "true".to_string())]
        } else {
            Vec::new()
        };
        self.stream_logs(
            &format!("/projects/{project}/services/{service}/builds/{id}/logs"),
            &query,
            consumer,
        )
    }

    pub(crate) fn list_permissions(
        &self,
        project: &str,
        namespace: &str,
        prefix: &str,
    ) -> Result<Vec<Permission>, ValarError> {
        self.call_list(&format!("/projects/{project}/permissions"), |req| {
            req.query(&[("namespace", namespace), ("prefix", prefix)])
        })
    }

    /// Returns whether the server changed anything.
    pub(crate) fn modify_permission(
        &self,
        project: &str,
        permission: &Permission,
    ) -> Result<bool, ValarError> {
        let resp: Modified = self.call(
            Method::POST,
            &format!("/projects/{project}/permissions"),
            |req| req.json(permission),
        )?;
        Ok(resp.modified)
    }

    pub(crate) fn check_permission(
        &self,
        project: &str,
        permission: &Permission,
    ) -> Result<bool, ValarError> {
        let resp: Allowed = self.call(
            Method::POST,
            &format!("/projects/{project}/permissions"),
            |req| req.query(&[("mode", "check")]).json(permission),
        )?;
        Ok(resp.allowed)
    }

    pub(crate) fn list_deployments(&self, project: &str, service: &str) -> Result<Vec<Deployment>, ValarError> {
        self.call_list(&format!("/projects/{project}/services/{service}/deploys"), |req| req)
    }

    pub(crate) fn submit_deploy(
        &self,
        project: &str,
        service: &str,
        request: &DeployRequest,
    ) -> Result<Deployment, ValarError> {
        self.call(
            Method::POST,
            &format!("/projects/{project}/services/{service}/deploys"),
            |req| req.json(request),
        )
    }

    pub(crate) fn rollback_deploy(
        &self,
        project: &str,
        service: &str,
        request: &RollbackRequest,
    ) -> Result<Deployment, ValarError> {
        self.call(
            Method::POST,
            &format!("/projects/{project}/services/{service}/deploys/rollback"),
            |req| req.json(request),
        )
    }

    pub(crate) fn encrypt_environment(&self, project: &str, pair: &KVPair) -> Result<KVPair, ValarError> {
        self.call(
            Method::POST,
            &format!("/projects/{project}/environment/encrypt"),
            |req| req.json(pair),
        )
    }

    pub(crate) fn list_domains(&self, project: &str) -> Result<Vec<Domain>, ValarError> {
        self.call_list(&format!("/projects/{project}/domains"), |req| req)
    }

    /// Registers a domain and returns the DNS records needed to verify it.
    pub(crate) fn add_domain(
        &self,
        project: &str,
        domain: &str,
    ) -> Result<BTreeMap<String, String>, ValarError> {
        let records: Option<BTreeMap<String, String>> = self.call(
            Method::POST,
            &format!("/projects/{project}/domains"),
            |req| req.json(&serde_json::json!({ "domain": domain })),
        )?;
        Ok(records.unwrap_or_default())
    }

    pub(crate) fn delete_domain(&self, project: &str, domain: &str) -> Result<(), ValarError> {
        self.call_unit(
            Method::DELETE,
            &format!("/projects/{project}/domains/{domain}"),
            |req| req,
        )
    }

    pub(crate) fn link_domain(
        &self,
        project: &str,
        domain: &str,
        service: &str,
        allow_insecure_traffic: bool,
    ) -> Result<(), ValarError> {
        self.call_unit(
            Method::POST,
            &format!("/projects/{project}/domains/{domain}/link"),
            |req| {
                req.json(&serde_json::json!({
                    "service": service,
                    "allowInsecureTraffic": allow_insecure_traffic,
                }))
            },
        )
    }

    pub(crate) fn unlink_domain(&self, project: &str, domain: &str, service: &str) -> Result<(), ValarError> {
        self.call_unit(
            Method::DELETE,
            &format!("/projects/{project}/domains/{domain}/link"),
            |req| req.json(&serde_json::json!({ "service": service })),
        )
    }

    pub(crate) fn verify_domain(&self, project: &str, domain: &str) -> Result<Domain, ValarError> {
        self.call(
            Method::POST,
            &format!("/projects/{project}/domains/{domain}/verify"),
            |req| req,
        )
    }

    pub(crate) fn list_schedules(&self, project: &str, service: &str) -> Result<Vec<Schedule>, ValarError> {
        self.call_list(&format!("/projects/{project}/services/{service}/schedules"), |req| req)
    }

    pub(crate) fn set_schedule(
        &self,
        project: &str,
        service: &str,
        schedule: &Schedule,
    ) -> Result<(), ValarError> {
        self.call_unit(
            Method::POST,
            &format!("/projects/{project}/services/{service}/schedules"),
            |req| req.json(schedule),
        )
    }

    pub(crate) fn delete_schedule(&self, project: &str, service: &str, name: &str) -> Result<(), ValarError> {
        self.call_unit(
            Method::DELETE,
            &format!("/projects/{project}/services/{service}/schedules/{name}"),
            |req| req,
        )
    }

    pub(crate) fn trigger_schedule(&self, project: &str, service: &str, name: &str) -> Result<(), ValarError> {
        self.call_unit(
            Method::POST,
            &format!("/projects/{project}/services/{service}/schedules/{name}/trigger"),
            |req| req,
        )
    }

    pub(crate) fn inspect_schedule(
        &self,
        project: &str,
        service: &str,
        name: &str,
    ) -> Result<ScheduleDetails, ValarError> {
        self.call(
            Method::GET,
            &format!("/projects/{project}/services/{service}/schedules/{name}"),
            |req| req,
        )
    }
}

fn error_from_response(response: Response) -> ApiError {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.trim().to_string(),
    };
    ApiError { status, message }
}

impl BuildLogSource for Client {
    fn inspect_build(&self, project: &str, service: &str, id: &str) -> Result<Build, ValarError> {
        Client::inspect_build(self, project, service, id)
    }

    fn build_logs(
        &self,
        project: &str,
        service: &str,
        id: &str,
        follow: bool,
        consumer: &mut LogConsumer<'_>,
    ) -> Result<(), ValarError> {
        Client::build_logs(self, project, service, id, follow, consumer)
    }
}
