use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The two external programs a tunnel session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// SSH client exposing the dynamic SOCKS forward.
    TunnelClient,
    /// HTTP proxy chained to the SOCKS forward.
    ProxyClient,
}

impl Helper {
    pub fn name(self) -> &'static str {
        match self {
            Helper::TunnelClient => "tunnel-client",
            Helper::ProxyClient => "proxy-client",
        }
    }
}

impl fmt::Display for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("No executable content available for {0}")]
    MissingContent(Helper),
    #[error("Failed to read executable content for {helper} from '{path}': {source}")]
    Source {
        helper: Helper,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to obtain temporary space in '{dir}': {source}")]
    TempSpace {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write executable for {helper}: {source}")]
    Write {
        helper: Helper,
        #[source]
        source: std::io::Error,
    },
}

/// Supplies the bytes of a helper executable.
pub trait ExecutableSource {
    fn content(&self, helper: Helper) -> Result<Cow<'_, [u8]>, ProvisionError>;
}
