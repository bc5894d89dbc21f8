use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Malformed host key: {0}")]
    Decode(String),
    #[error("Unsupported host key type '{0}', only ssh-rsa is accepted")]
    UnsupportedKeyType(String),
    #[error("Failed to persist host key '{key}': {source}")]
    Persist {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// A persistent key/value namespace the tunnel client consults for known host keys.
///
/// Writes overwrite any previous value for the same key and never touch other keys.
pub trait TrustStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), TrustError>;
}

impl<T: TrustStore + ?Sized> TrustStore for &mut T {
    fn put(&mut self, key: &str, value: &str) -> Result<(), TrustError> {
        (**self).put(key, value)
    }
}

impl<T: TrustStore + ?Sized> TrustStore for Box<T> {
    fn put(&mut self, key: &str, value: &str) -> Result<(), TrustError> {
        (**self).put(key, value)
    }
}
