//! Wire payloads for the Longhorn v1 API.

use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub(super) struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub(super) data: Vec<T>,
}

#[derive(Deserialize)]
pub(super) struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl ApiErrorBody {
    pub(super) fn into_message(self) -> Option<String> {
        self.message
            .filter(|text| !text.trim().is_empty())
            .or(self.code)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateVolumeInput<'a> {
    pub(super) name: &'a str,
    pub(super) size: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) from_backup: Option<&'a str>,
}

#[derive(Serialize)]
pub(super) struct BackupGetInput {
    pub(super) name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PvCreateInput<'a> {
    pub(super) pv_name: &'a str,
    pub(super) fs_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PvcCreateInput<'a> {
    pub(super) namespace: &'a str,
    pub(super) pvc_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RecurringJobAddInput<'a> {
    pub(super) name: &'a str,
    pub(super) is_group: bool,
}
