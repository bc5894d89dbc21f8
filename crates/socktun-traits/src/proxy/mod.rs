use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to run system proxy command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("System proxy command '{command}' exited with {status}")]
    Failed { command: String, status: String },
}

/// Applies and reverts the machine-wide HTTP proxy setting.
///
/// `revert` must be safe to call when `configure` was never called.
pub trait SystemProxy {
    fn configure(&mut self) -> Result<(), ProxyError>;
    fn revert(&mut self) -> Result<(), ProxyError>;
}

impl<T: SystemProxy + ?Sized> SystemProxy for Box<T> {
    fn configure(&mut self) -> Result<(), ProxyError> {
        (**self).configure()
    }

    fn revert(&mut self) -> Result<(), ProxyError> {
        (**self).revert()
    }
}
