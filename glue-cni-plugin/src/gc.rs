use tracing::info;

use crate::{config::Args, response::Response, types::NetConf};

pub fn gc(_args: &Args, conf: NetConf) -> Response {
    info!(name = %conf.name, "gc called");
    Response::Gc
}

pub fn status(_args: &Args, conf: NetConf) -> Response {
    info!(name = %conf.name, "status called");
    Response::Status
}
