use tracing::{error, info, warn};

use crate::config::Args;
use crate::delegate::DelegateInvoker;
use crate::response::Response;
use crate::store::RecordStore;
use crate::types::{DelegateHeader, NetConf};
use crate::{Result, ensure_supported};

pub fn delete(args: &Args, conf: NetConf, delegate: &impl DelegateInvoker) -> Response {
    info!(container_id = %args.container_id, "delete called");
    match try_delete(args, &conf, delegate) {
        Ok(()) => Response::Delete,
        Err(e) => {
            error!(%e, container_id = %args.container_id, "delete failed");
            e.into_response(conf.cni_version)
        }
    }
}

/// Detaches one container using the delegate configuration stored at attach
/// time. A container without a record is already detached.
pub fn try_delete(args: &Args, conf: &NetConf, delegate: &impl DelegateInvoker) -> Result<()> {
    ensure_supported(&conf.cni_version)?;
    args.require_container()?;

    let store = RecordStore::new(&conf.data_dir);
    let Some(buf) = store.load(&args.container_id)? else {
        info!(container_id = %args.container_id, "no attachment record, nothing to delete");
        return Ok(());
    };

    let header: DelegateHeader = serde_json::from_slice(&buf)?;
    let result = delegate.delete(&header.r#type, &buf);

    if let Err(e) = store.remove(&args.container_id) {
        warn!(%e, container_id = %args.container_id, "failed to remove attachment record");
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::add::test::{FakeDelegate, args, setup};
    use crate::add::try_add;
    use crate::neighbor::{NeighborEntry, NeighborInstaller};

    struct NoNeighbors;

    impl NeighborInstaller for NoNeighbors {
        fn install(
            &self,
            _netns: &std::path::Path,
            _ifname: &str,
            _entry: &NeighborEntry,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_delete_unknown_container() {
        let (_dir, conf) = setup("macvlan");
        let delegate = FakeDelegate::default();

        try_delete(&args(), &conf, &delegate).unwrap();
        try_delete(&args(), &conf, &delegate).unwrap();
        assert!(delegate.calls.borrow().is_empty());
        assert!(!conf.data_dir.exists());
    }

    #[test]
    fn test_delete_uses_stored_record() {
        let (_dir, conf) = setup("ipvlan");
        let delegate = FakeDelegate::default();
        try_add(&args(), &conf, &delegate, &NoNeighbors).unwrap();

        try_delete(&args(), &conf, &delegate).unwrap();

        let calls = delegate.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "DEL");
        assert_eq!(calls[1].1, "ipvlan");
        assert_eq!(calls[1].2, calls[0].2);
        assert!(RecordStore::new(&conf.data_dir).load("c1").unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_record_when_delegate_fails() {
        let (_dir, conf) = setup("macvlan");
        try_add(&args(), &conf, &FakeDelegate::default(), &NoNeighbors).unwrap();
        let delegate = FakeDelegate {
            fail_delete: true,
            ..Default::default()
        };

        assert!(try_delete(&args(), &conf, &delegate).is_err());
        assert!(RecordStore::new(&conf.data_dir).load("c1").unwrap().is_none());
    }
}
