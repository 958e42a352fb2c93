use std::collections::HashMap;
use std::io::Write;
use std::process::ExitCode;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::types::{Dns, Interface, Ip, Route};

#[derive(Debug)]
pub enum Response {
    Success(Success),
    Error(CniErrorResponse),
    Version(VersionResponse),
    Delete,
    Gc,
    Check,
    Status,
}

impl Response {
    /// Prints the response on stdout. Errors are printed too, but exit non-zero.
    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(success) => (serde_json::to_vec(success), ExitCode::SUCCESS),
            Response::Error(err) => (serde_json::to_vec(err), ExitCode::FAILURE),
            Response::Version(version) => (serde_json::to_vec(version), ExitCode::SUCCESS),
            Response::Delete | Response::Check | Response::Gc | Response::Status => {
                (Ok(vec![]), ExitCode::SUCCESS)
            }
        };
        let out = match out {
            Ok(out) => out,
            Err(e) => {
                error!(%e, "failed to serialize response");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = std::io::stdout().write_all(&out) {
            error!(%e, "failed to write out response to stdout");
            return ExitCode::FAILURE;
        }
        code
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub ips: Vec<Ip>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,

    #[serde(flatten)]
    pub custom: HashMap<String, Value>,
}

impl Success {
    /// Re-labels a delegate result with the version the runtime asked for.
    pub fn with_version(mut self, cni_version: Version) -> Self {
        self.cni_version = cni_version;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec"
    )]
    pub supported_versions: Vec<Version>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_success_keeps_unknown_fields() {
        let success: Success = serde_json::from_value(json!({
            "cniVersion": "1.0.0",
            "interfaces": [{"name": "eth0", "sandbox": "/var/run/netns/a"}],
            "ips": [{"address": "172.24.0.2/21", "gateway": "172.24.0.1", "interface": 0}],
            "routes": [{"dst": "0.0.0.0/0"}],
            "dns": {},
            "vendor": "x",
        }))
        .unwrap();
        let success = success.with_version(Version::new(0, 4, 0));
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value["cniVersion"], "0.4.0");
        assert_eq!(value["vendor"], "x");
        assert_eq!(value["ips"][0]["gateway"], "172.24.0.1");
    }
}
