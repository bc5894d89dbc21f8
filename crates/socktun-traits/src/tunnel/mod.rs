use std::path::PathBuf;
use thiserror::Error;

use crate::provision::Helper;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to spawn {helper} from '{path}': {source}")]
    Spawn {
        helper: Helper,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Filesystem locations of the provisioned helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPaths {
    pub tunnel_client: PathBuf,
    pub proxy_client: PathBuf,
}
