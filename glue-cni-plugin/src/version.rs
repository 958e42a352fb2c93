use tracing::info;

use crate::{
    CNI_VERSION, SUPPORTED_CNI_VERSION,
    response::{Response, VersionResponse},
};

pub fn version() -> Response {
    info!("version called");
    Response::Version(VersionResponse {
        cni_version: CNI_VERSION,
        supported_versions: SUPPORTED_CNI_VERSION.to_vec(),
    })
}
