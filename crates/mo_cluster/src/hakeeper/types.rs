use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Store labels as HAKeeper encodes them
pub type StoreLabels = BTreeMap<String, Vec<String>>;

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    #[default]
    Working,
    Draining,
}

impl WorkState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Draining" => WorkState::Draining,
            _ => WorkState::Working,
        }
    }
}

impl Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkState::Working => write!(f, "Working"),
            WorkState::Draining => write!(f, "Draining"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CNStore {
    pub uuid: String,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub sql_address: String,
    #[serde(default)]
    pub lock_service_address: String,
    #[serde(default)]
    pub query_address: String,
    #[serde(default)]
    pub work_state: WorkState,
    #[serde(default)]
    pub labels: StoreLabels,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TNStore {
    pub uuid: String,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub lock_service_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogStoreInfo {
    pub uuid: String,
    #[serde(default)]
    pub service_address: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetails {
    #[serde(default)]
    pub cn_stores: Vec<CNStore>,
    #[serde(default)]
    pub tn_stores: Vec<TNStore>,
    #[serde(default)]
    pub log_stores: Vec<LogStoreInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchCNStoreRequest {
    pub uuid: String,
    pub state: WorkState,
    /// None leaves labels untouched, an empty map removes all of them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<StoreLabels>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CNLabelRequest {
    pub uuid: String,
    pub labels: StoreLabels,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    pub uuid: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoolResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    pub count: i64,
}

/// Session accounts owned by the database itself
pub const SYS_ACCOUNT: &str = "sys";
pub const SESSION_SOURCE_LABEL: &str = "source";
pub const PROXY_SOURCE: &str = "Proxy";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub conn_id: u64,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessList {
    #[serde(default)]
    pub sessions: Vec<Session>,
}

/// How a CN counts the sessions that still need migrating
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCounting {
    /// Every session outside the system account
    NonSysAccount,
    /// Only sessions routed through the proxy
    ProxySource,
}

impl SessionCounting {
    pub fn count(&self, sessions: &[Session]) -> i64 {
        sessions
            .iter()
            .filter(|s| match self {
                SessionCounting::NonSysAccount => s.account != SYS_ACCOUNT,
                SessionCounting::ProxySource => {
                    s.labels.get(SESSION_SOURCE_LABEL).map(String::as_str) == Some(PROXY_SOURCE)
                }
            })
            .count() as i64
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    fn session(account: &str, source: Option<&str>) -> Session {
        Session {
            account: account.to_string(),
            labels: source
                .map(|s| BTreeMap::from([(SESSION_SOURCE_LABEL.to_string(), s.to_string())]))
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn session_counting_modes() {
        let sessions = vec![
            session("sys", None),
            session("acc1", None),
            session("acc1", Some("Proxy")),
            session("sys", Some("Proxy")),
        ];
        assert_eq!(SessionCounting::NonSysAccount.count(&sessions), 2);
        assert_eq!(SessionCounting::ProxySource.count(&sessions), 2);
    }

    #[test]
    fn patch_request_wire_format() {
        let req = PatchCNStoreRequest {
            uuid: "u1".to_string(),
            state: WorkState::Draining,
            labels: Some(StoreLabels::new()),
        };
        assert_json_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"uuid": "u1", "state": "Draining", "labels": {}})
        );
        let req = PatchCNStoreRequest {
            labels: None,
            ..req
        };
        assert_json_eq!(serde_json::to_value(&req).unwrap(), json!({"uuid": "u1", "state": "Draining"}));
    }
}
