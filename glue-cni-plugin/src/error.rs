use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("incompatible version {0}")]
    IncompatibleVersion(Version),

    #[error("container unknown: {0}")]
    ContainerUnknown(String),

    #[error("unsupported field: {key}={value}")]
    UnsupportedField { key: String, value: String },

    #[error("invalid environment variables: {0}")]
    InvalidRequiredEnvVariables(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Error reported by the delegated plugin, kept as it was received.
    #[error("{msg}: {details}")]
    Delegate {
        code: u32,
        msg: String,
        details: String,
    },

    #[error("failed to execute delegate {plugin}: {reason}")]
    DelegateExec { plugin: String, reason: String },

    #[error("failed to install neighbor: {0}")]
    Neighbor(String),
}

impl From<glue_cni_common::Error> for Error {
    fn from(err: glue_cni_common::Error) -> Self {
        match err {
            glue_cni_common::Error::Io(e) => Self::Io(e),
            glue_cni_common::Error::Json(e) => Self::Json(e),
            glue_cni_common::Error::InvalidTopology(e) => Self::InvalidTopology(e),
        }
    }
}

impl From<netns_rs::Error> for Error {
    fn from(err: netns_rs::Error) -> Self {
        Self::Neighbor(err.to_string())
    }
}

impl Error {
    fn code_and_msg(&self) -> (u32, &str) {
        match self {
            Error::IncompatibleVersion(_) => (1, "Incompatible Version"),
            Error::UnsupportedField { .. } => (2, "Unsupported Field"),
            Error::ContainerUnknown(_) => (3, "Container Unknown"),
            Error::InvalidRequiredEnvVariables(_) => (4, "Invalid Required Environment Variables"),
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) => (6, "JSON Error"),
            Error::InvalidNetworkConfig(_) | Error::InvalidTopology(_) => {
                (7, "Invalid Network Config")
            }
            Error::Transient(_) => (11, "Transient Error"),
            Error::Delegate { code, msg, .. } => (*code, msg.as_str()),
            Error::Neighbor(_) => (100, "Neighbor Error"),
            Error::DelegateExec { .. } => (101, "Delegate Error"),
            Error::Parse(_) => (102, "Parse Error"),
        }
    }

    pub fn into_response(self, cni_version: Version) -> Response {
        let (code, msg) = self.code_and_msg();
        let msg = msg.to_owned();
        let details = match self {
            Error::Delegate { details, .. } => details,
            other => other.to_string(),
        };
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg,
            details,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CNI_VERSION;

    #[test]
    fn test_delegate_error_is_verbatim() {
        let err = Error::Delegate {
            code: 11,
            msg: "failed to allocate".into(),
            details: "no IP addresses available in range set".into(),
        };
        let Response::Error(resp) = err.into_response(CNI_VERSION) else {
            panic!("expected error response");
        };
        assert_eq!(resp.code, 11);
        assert_eq!(resp.msg, "failed to allocate");
        assert_eq!(resp.details, "no IP addresses available in range set");
    }

    #[test]
    fn test_invalid_topology_is_network_config_error() {
        let err = Error::from(glue_cni_common::Error::InvalidTopology("missing".into()));
        let Response::Error(resp) = err.into_response(CNI_VERSION) else {
            panic!("expected error response");
        };
        assert_eq!(resp.code, 7);
        assert_eq!(resp.details, "invalid topology: missing");
    }
}
