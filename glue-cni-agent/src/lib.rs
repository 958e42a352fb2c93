pub mod agent;
pub mod cni;
pub mod config;
pub mod http;
pub mod kubernetes;
pub mod metrics;
pub mod reconcile;
pub mod route;
pub mod topology;

use thiserror::Error;

use crate::reconcile::command::CommandFailure;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create config from kubeconfig: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("failed to infer kubernetes config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),

    #[error("failed to parse cluster configuration: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("invalid cidr: {0}")]
    CidrParse(#[from] ipnetwork::IpNetworkError),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("device operation {op} failed: {source}")]
    DeviceOp {
        op: &'static str,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("rule operation failed: {0}")]
    RuleOp(CommandFailure),

    #[error("filter operation failed: {0}")]
    FilterOp(CommandFailure),

    #[error("unable to send event due to channel error")]
    ChannelError,

    #[error("task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::IoError(_) => "io",
            Error::KubeError(_) | Error::KubeConfig(_) | Error::InferConfig(_) => "kube",
            Error::YamlConversion(_) | Error::JsonConversion(_) | Error::CidrParse(_) => "parse",
            Error::InvalidTopology(_) | Error::Config(_) => "config",
            Error::DeviceOp { .. } | Error::LinkNotFound(_) => "device",
            Error::RuleOp(_) => "rule",
            Error::FilterOp(_) => "filter",
            Error::ChannelError | Error::Task(_) => "task",
        }
        .into()
    }
}

impl From<glue_cni_common::Error> for Error {
    fn from(err: glue_cni_common::Error) -> Self {
        match err {
            glue_cni_common::Error::Io(e) => Self::IoError(e),
            glue_cni_common::Error::Json(e) => Self::JsonConversion(e),
            glue_cni_common::Error::InvalidTopology(e) => Self::InvalidTopology(e),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
