use serde_json::{Map, Value};
use tracing::{error, info};

use crate::config::Args;
use crate::delegate::DelegateInvoker;
use crate::response::Response;
use crate::store::RecordStore;
use crate::types::{DelegateHeader, NetConf};
use crate::{Result, ensure_supported};

pub fn check(args: &Args, conf: NetConf, delegate: &impl DelegateInvoker) -> Response {
    info!(container_id = %args.container_id, name = %conf.name, "check called");
    match try_check(args, &conf, delegate) {
        Ok(()) => Response::Check,
        Err(e) => {
            error!(%e, container_id = %args.container_id, "check failed");
            e.into_response(conf.cni_version)
        }
    }
}

/// Asks the delegate to verify the container's interface using the stored
/// delegate configuration. A container without a record has nothing to check.
pub fn try_check(args: &Args, conf: &NetConf, delegate: &impl DelegateInvoker) -> Result<()> {
    ensure_supported(&conf.cni_version)?;
    args.require_container()?;

    let store = RecordStore::new(&conf.data_dir);
    let Some(buf) = store.load(&args.container_id)? else {
        info!(container_id = %args.container_id, "no attachment record, nothing to check");
        return Ok(());
    };

    let header: DelegateHeader = serde_json::from_slice(&buf)?;
    let mut record: Map<String, Value> = serde_json::from_slice(&buf)?;
    if let Some(previous) = &conf.previous_result {
        record.insert("prevResult".into(), previous.clone());
    }
    delegate.check(&header.r#type, &serde_json::to_vec(&record)?)
}
