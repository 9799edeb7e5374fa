use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ValarError;

/// A resource path such as `service:my-proj/api`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct PermissionPath {
    pub(crate) namespace: String,
    pub(crate) items: Vec<String>,
}

/// A principal such as `user:alice`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct PermissionUser {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) identifier: Vec<String>,
}

fn split_head(raw: &str) -> Option<(String, Vec<String>)> {
    let (head, rest) = raw.split_once(':')?;
    let items = rest.split('/').map(str::to_string).collect();
    Some((head.to_string(), items))
}

impl FromStr for PermissionPath {
    type Err = ValarError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (namespace, items) = split_head(raw).ok_or_else(|| {
            ValarError::Validation(format!("invalid permission path: {raw}"))
        })?;
        Ok(PermissionPath { namespace, items })
    }
}

impl fmt::Display for PermissionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.items.join("/"))
    }
}

impl FromStr for PermissionUser {
    type Err = ValarError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, identifier) = split_head(raw).ok_or_else(|| {
            ValarError::Validation(format!("invalid permission user: {raw}"))
        })?;
        Ok(PermissionUser { kind, identifier })
    }
}

impl fmt::Display for PermissionUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.identifier.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PermissionState {
    Allow,
    Deny,
    Unset,
}

impl PermissionState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Allow => "allow",
            PermissionState::Deny => "deny",
            PermissionState::Unset => "unset",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub(crate) struct Permission {
    pub(crate) path: PermissionPath,
    pub(crate) user: PermissionUser,
    pub(crate) action: String,
    #[serde(default)]
    pub(crate) state: String,
}

impl Permission {
    pub(crate) fn parse(
        path: &str,
        user: &str,
        action: &str,
        state: Option<PermissionState>,
    ) -> Result<Self, ValarError> {
        Ok(Permission {
            path: path.parse()?,
            user: user.parse()?,
            action: action.to_string(),
            state: state.map(|s| s.as_str().to_string()).unwrap_or_default(),
        })
    }
}
