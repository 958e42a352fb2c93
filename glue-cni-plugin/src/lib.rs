pub mod add;
pub mod check;
pub mod config;
pub mod delegate;
pub mod delete;
pub mod error;
pub mod gc;
pub mod neighbor;
pub mod response;
pub mod store;
pub mod types;
pub mod version;

use semver::Version;

pub use crate::error::Error;

pub(crate) use glue_cni_common::{
    deserialize_from_str, deserialize_from_str_vec, serialize_to_string,
    serialize_to_string_slice,
};

pub const CNI_VERSION: Version = Version::new(1, 1, 0);
pub const SUPPORTED_CNI_VERSION: [Version; 4] = [
    Version::new(0, 3, 1),
    Version::new(0, 4, 0),
    Version::new(1, 0, 0),
    Version::new(1, 1, 0),
];

pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/glue";

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn ensure_supported(version: &Version) -> Result<()> {
    if SUPPORTED_CNI_VERSION.contains(version) {
        Ok(())
    } else {
        Err(Error::IncompatibleVersion(version.clone()))
    }
}
