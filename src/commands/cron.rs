use serde_json::json;

use crate::api::{Schedule, ScheduleDetails};
use crate::commands::connect;
use crate::table::{colorize_status, print_fields, print_table};
use crate::{emit, Context, CronCommand, ServiceTarget, ValarError};

const DEFAULT_SCHEDULE_PATH: &str = "/";

/// Flag values of `cron set`; unset fields keep the stored value on update.
#[derive(Debug, Default)]
struct ScheduleChanges {
    timespec: Option<String>,
    path: Option<String>,
    payload: Option<String>,
    enabled: Option<bool>,
}

fn status_label(enabled: bool) -> String {
    if enabled { "enabled" } else { "disabled" }.to_string()
}

/// Merges the flags into the existing schedule, or builds a new one when none exists.
fn apply_changes(
    name: &str,
    existing: Option<Schedule>,
    changes: ScheduleChanges,
) -> Result<Schedule, ValarError> {
    match existing {
        Some(mut schedule) => {
            if let Some(timespec) = changes.timespec {
                schedule.timespec = timespec;
            }
            if let Some(path) = changes.path {
                schedule.path = path;
            }
            if let Some(payload) = changes.payload {
                schedule.payload = payload;
            }
            if let Some(enabled) = changes.enabled {
                schedule.status = status_label(enabled);
            }
            Ok(schedule)
        }
        None => {
            let timespec = changes.timespec.ok_or_else(|| {
                ValarError::Validation(
                    "Timespec must be specified when setting a schedule for the first time."
                        .to_string(),
                )
            })?;
            Ok(Schedule {
                name: name.to_string(),
                timespec,
                path: changes
                    .path
                    .unwrap_or_else(|| DEFAULT_SCHEDULE_PATH.to_string()),
                payload: changes.payload.unwrap_or_default(),
                status: status_label(changes.enabled.unwrap_or(true)),
            })
        }
    }
}

pub(crate) fn handle_cron(
    ctx: &Context,
    target: &ServiceTarget,
    command: CronCommand,
) -> Result<(), ValarError> {
    let remote = connect(ctx, target, true)?;
    let project = remote.project()?;
    let service = remote.service()?;
    match command {
        CronCommand::List => {
            let schedules = remote.client.list_schedules(project, service)?;
            let rows: Vec<Vec<String>> = schedules
                .iter()
                .map(|schedule| {
                    vec![
                        schedule.name.clone(),
                        schedule.timespec.clone(),
                        schedule.path.clone(),
                        colorize_status(&schedule.status),
                    ]
                })
                .collect();
            emit(ctx, &schedules, || {
                print_table(&["NAME", "TIMESPEC", "PATH", "STATUS"], &rows)?;
                Ok(())
            })
        }
        CronCommand::Set {
            name,
            timespec,
            path,
            payload,
            enable,
            disable,
        } => {
            let existing = match remote.client.inspect_schedule(project, service, &name) {
                Ok(details) => details.schedule,
                Err(ValarError::Api(err)) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            let enabled = match (enable, disable) {
                (_, true) => Some(false),
                (true, false) => Some(true),
                (false, false) => None,
            };
            let schedule = apply_changes(
                &name,
                existing,
                ScheduleChanges {
                    timespec,
                    path,
                    payload,
                    enabled,
                },
            )?;
            remote.client.set_schedule(project, service, &schedule)?;
            emit(ctx, &schedule, || Ok(()))
        }
        CronCommand::Trigger { name } => {
            remote.client.trigger_schedule(project, service, &name)?;
            emit(ctx, &json!({ "triggered": name }), || Ok(()))
        }
        CronCommand::Delete { name } => {
            remote.client.delete_schedule(project, service, &name)?;
            emit(ctx, &json!({ "deleted": name }), || Ok(()))
        }
        CronCommand::Inspect { name } => {
            let details = remote.client.inspect_schedule(project, service, &name)?;
            emit(ctx, &details, || {
                print_fields(&schedule_fields(&details))?;
                Ok(())
            })
        }
    }
}

fn schedule_fields(details: &ScheduleDetails) -> Vec<(&'static str, String)> {
    let schedule = details.schedule.clone().unwrap_or_default();
    let mut fields = vec![
        ("Name", schedule.name),
        ("Timespec", schedule.timespec),
        ("Path", schedule.path),
        ("Payload", schedule.payload),
        ("Status", colorize_status(&schedule.status)),
    ];
    match &details.invocation {
        None => fields.push(("Last Run", "-".to_string())),
        Some(run) => {
            fields.push(("Last Run", String::new()));
            fields.push(("  Start", run.start_time.to_rfc3339()));
            fields.push((
                "  End",
                run.end_time
                    .map(|end| end.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
            ));
            fields.push(("  Status", colorize_status(&run.status)));
            if !run.triggered_by.is_empty() {
                fields.push(("  Trigger", run.triggered_by.clone()));
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> Schedule {
        Schedule {
            name: "nightly".to_string(),
            timespec: "0 3 * * *".to_string(),
            path: "/jobs".to_string(),
            payload: "{}".to_string(),
            status: "enabled".to_string(),
        }
    }

    #[test]
    fn new_schedule_requires_timespec() {
        let err = apply_changes("nightly", None, ScheduleChanges::default()).unwrap_err();
        assert!(err.to_string().contains("Timespec must be specified"));
    }

    #[test]
    fn new_schedule_defaults_path_and_enables() {
        let schedule = apply_changes(
            "nightly",
            None,
            ScheduleChanges {
                timespec: Some("*/5 * * * *".to_string()),
                ..ScheduleChanges::default()
            },
        )
        .unwrap();
        assert_eq!(schedule.path, "/");
        assert_eq!(schedule.status, "enabled");
        assert_eq!(schedule.name, "nightly");
    }

    #[test]
    fn update_only_touches_given_fields() {
        let schedule = apply_changes(
            "nightly",
            Some(stored()),
            ScheduleChanges {
                enabled: Some(false),
                ..ScheduleChanges::default()
            },
        )
        .unwrap();
        assert_eq!(schedule.timespec, "0 3 * * *");
        assert_eq!(schedule.path, "/jobs");
        assert_eq!(schedule.status, "disabled");
    }

    #[test]
    fn inspect_without_run_shows_dash() {
        let details = ScheduleDetails {
            invocation: None,
            schedule: Some(stored()),
        };
        let fields = schedule_fields(&details);
        assert_eq!(fields.last().unwrap(), &("Last Run", "-".to_string()));
    }
}
