use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use socktun_traits::provision::{ExecutableSource, Helper, ProvisionError};
use socktun_traits::tunnel::HelperPaths;

/// Reads helper executables from existing files, e.g. binaries shipped next to ours.
///
/// A bare program name such as `plink` is looked up in `PATH`.
#[derive(Debug, Clone)]
pub struct FileSource {
    tunnel_client: PathBuf,
    proxy_client: PathBuf,
}

impl FileSource {
    pub fn new(tunnel_client: impl Into<PathBuf>, proxy_client: impl Into<PathBuf>) -> Self {
        Self {
            tunnel_client: tunnel_client.into(),
            proxy_client: proxy_client.into(),
        }
    }

    fn path(&self, helper: Helper) -> &Path {
        match helper {
            Helper::TunnelClient => &self.tunnel_client,
            Helper::ProxyClient => &self.proxy_client,
        }
    }
}

impl ExecutableSource for FileSource {
    fn content(&self, helper: Helper) -> Result<Cow<'_, [u8]>, ProvisionError> {
        let path = resolve_program(self.path(helper), env::var_os("PATH"));
        debug!("Reading {} from {}", helper, path.display());
        fs::read(&path)
            .map(Cow::Owned)
            .map_err(|source| ProvisionError::Source { helper, path, source })
    }
}

/// Finds a bare program name in `search_path`. Anything with a directory part, and a
/// name found nowhere, is returned unchanged.
fn resolve_program(program: &Path, search_path: Option<OsString>) -> PathBuf {
    let is_bare = program.components().count() == 1 && program.is_relative();
    let Some(search_path) = search_path.filter(|_| is_bare) else {
        return program.to_path_buf();
    };

    for dir in env::split_paths(&search_path) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return candidate;
        }
        #[cfg(windows)]
        {
            let candidate = candidate.with_extension("exe");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    program.to_path_buf()
}

/// Helper executables compiled into the calling binary with `include_bytes!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedSource {
    pub tunnel_client: Option<&'static [u8]>,
    pub proxy_client: Option<&'static [u8]>,
}

impl ExecutableSource for EmbeddedSource {
    fn content(&self, helper: Helper) -> Result<Cow<'_, [u8]>, ProvisionError> {
        let bytes = match helper {
            Helper::TunnelClient => self.tunnel_client,
            Helper::ProxyClient => self.proxy_client,
        };
        bytes
            .map(Cow::Borrowed)
            .ok_or(ProvisionError::MissingContent(helper))
    }
}

/// Writes each helper to a private temporary file once and remembers where.
///
/// The files outlive the provisioner so a later session can be pointed at them.
pub struct ExecutableProvisioner<S> {
    source: S,
    dir: Option<PathBuf>,
    cache: HashMap<Helper, PathBuf>,
}

impl<S: ExecutableSource> ExecutableProvisioner<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            dir: None,
            cache: HashMap::new(),
        }
    }

    /// Provision into `dir` instead of the system temp directory, for hosts that mount
    /// `/tmp` noexec.
    pub fn with_dir(source: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            dir: Some(dir.into()),
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self, helper: Helper) -> Option<&Path> {
        self.cache.get(&helper).map(PathBuf::as_path)
    }

    pub fn provision(&mut self, helper: Helper) -> Result<PathBuf, ProvisionError> {
        if let Some(path) = self.cache.get(&helper) {
            debug!("{} already provisioned at {}", helper, path.display());
            return Ok(path.clone());
        }

        let dir = self.dir.clone().unwrap_or_else(std::env::temp_dir);
        let content = self.source.content(helper)?;
        let path = write_executable(&dir, helper, &content)?;
        info!("Provisioned {} at {}", helper, path.display());

        self.cache.insert(helper, path.clone());
        Ok(path)
    }

    pub fn provision_all(&mut self) -> Result<HelperPaths, ProvisionError> {
        Ok(HelperPaths {
            tunnel_client: self.provision(Helper::TunnelClient)?,
            proxy_client: self.provision(Helper::ProxyClient)?,
        })
    }
}

/// The temp file is deleted again on any failure, so a path is only returned for a
/// complete, synced copy.
fn write_executable(dir: &Path, helper: Helper, content: &[u8]) -> Result<PathBuf, ProvisionError> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("socktun-{}-", helper.name()))
        .tempfile_in(dir)
        .map_err(|source| ProvisionError::TempSpace {
            dir: dir.to_path_buf(),
            source,
        })?;

    let write_err = |source: std::io::Error| ProvisionError::Write { helper, source };

    file.write_all(content).map_err(write_err)?;
    file.as_file().sync_all().map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o755)).map_err(write_err)?;
    }

    // Close our handle before anyone tries to exec the file.
    let (handle, path) = file.keep().map_err(|e| write_err(e.error))?;
    drop(handle);

    Ok(path)
}
