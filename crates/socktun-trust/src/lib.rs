//! Registers SSH host keys with the tunnel client's host key cache.
//!
//! The server hands out its RSA host key as base64 of the SSH wire format: a run of
//! fields, each a big-endian `u32` length followed by that many bytes. The first field
//! is the algorithm name, the rest are the public exponent and modulus. The cache
//! stores the numbers as comma separated `0x` hex under `rsa2@<port>:<host>`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info};

use socktun_traits::trust::{TrustError, TrustStore};

pub const SUPPORTED_KEY_TYPE: &str = "ssh-rsa";

/// Algorithm label the cache uses for `ssh-rsa` keys.
const CACHE_KEY_TYPE: &str = "rsa2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyRecord {
    pub algorithm: String,
    pub host: String,
    pub port: u16,
    /// Encoded key fields, e.g. `0x010001,0x00c3...`.
    pub value: String,
}

impl HostKeyRecord {
    pub fn key_name(&self) -> String {
        cache_key_name(&self.host, self.port)
    }
}

pub fn cache_key_name(host: &str, port: u16) -> String {
    format!("{}@{}:{}", CACHE_KEY_TYPE, port, host)
}

/// Decodes and re-encodes a host key without touching any store.
pub fn encode_host_key(host: &str, port: u16, base64_blob: &str) -> Result<HostKeyRecord, TrustError> {
    // Keys copied from wrapped text carry line breaks.
    let compact: String = base64_blob
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let decoded = BASE64
        .decode(compact)
        .map_err(|e| TrustError::Decode(format!("invalid base64: {}", e)))?;

    let mut fields = FieldReader::new(&decoded);
    let algorithm = fields
        .next_field()?
        .ok_or_else(|| TrustError::Decode("empty key blob".to_string()))?;
    if algorithm != SUPPORTED_KEY_TYPE.as_bytes() {
        return Err(TrustError::UnsupportedKeyType(
            String::from_utf8_lossy(algorithm).into_owned(),
        ));
    }

    let mut encoded = Vec::new();
    while let Some(field) = fields.next_field()? {
        encoded.push(encode_field(field));
    }
    if encoded.is_empty() {
        return Err(TrustError::Decode("no key material after the algorithm name".to_string()));
    }

    Ok(HostKeyRecord {
        algorithm: SUPPORTED_KEY_TYPE.to_string(),
        host: host.to_string(),
        port,
        value: encoded.join(","),
    })
}

/// Encodes the host key and writes it to `store`, replacing any previous entry for the
/// same host and port. Nothing is written unless the whole key parses.
pub fn register<T: TrustStore + ?Sized>(
    store: &mut T,
    host: &str,
    port: u16,
    base64_blob: &str,
) -> Result<HostKeyRecord, TrustError> {
    let record = encode_host_key(host, port, base64_blob)?;
    let key = record.key_name();
    store.put(&key, &record.value)?;
    info!("Registered host key {}", key);
    Ok(record)
}

/// Iterates length-prefixed fields and rejects truncated input.
struct FieldReader<'a> {
    rest: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { rest: bytes }
    }

    fn next_field(&mut self) -> Result<Option<&'a [u8]>, TrustError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let Some((len_bytes, rest)) = self.rest.split_first_chunk::<4>() else {
            return Err(TrustError::Decode(format!(
                "{} trailing bytes after the last field",
                self.rest.len()
            )));
        };
        let len = u32::from_be_bytes(*len_bytes) as usize;
        if rest.len() < len {
            return Err(TrustError::Decode(format!(
                "field of {} bytes truncated to {}",
                len,
                rest.len()
            )));
        }
        let (field, rest) = rest.split_at(len);
        self.rest = rest;
        Ok(Some(field))
    }
}

/// Leading zero bytes are dropped but one byte always survives, so zero is `0x00`.
fn encode_field(field: &[u8]) -> String {
    let significant = match field.iter().position(|&b| b != 0) {
        Some(first) => &field[first..],
        None => &[0u8][..],
    };

    let mut out = String::with_capacity(2 + significant.len() * 2);
    out.push_str("0x");
    for byte in significant {
        // Writing to a String cannot fail.
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// In-process store, for tests and for embedders that persist entries themselves.
#[derive(Debug, Default, Clone)]
pub struct MemoryTrustStore {
    entries: BTreeMap<String, String>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TrustStore for MemoryTrustStore {
    fn put(&mut self, key: &str, value: &str) -> Result<(), TrustError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// PuTTY's host key cache file on Unix: one `<key> <value>` pair per line.
#[derive(Debug, Clone)]
pub struct HostKeyFile {
    path: PathBuf,
}

impl HostKeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in file order. A missing file holds no entries. Lines that are not a
    /// `<key> <value>` pair are skipped here but survive a rewrite.
    pub fn entries(&self) -> std::io::Result<Vec<(String, String)>> {
        Ok(self
            .lines()?
            .iter()
            .filter_map(|line| parse_line(line))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect())
    }

    fn lines(&self) -> std::io::Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    fn write_lines(&self, lines: &[String]) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
        }

        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    line.split_once(' ')
}

impl TrustStore for HostKeyFile {
    fn put(&mut self, key: &str, value: &str) -> Result<(), TrustError> {
        let persist_err = |source: std::io::Error| TrustError::Persist {
            key: key.to_string(),
            source,
        };

        let entry = format!("{} {}", key, value);
        let mut lines = self.lines().map_err(persist_err)?;
        match lines
            .iter_mut()
            .find(|line| parse_line(line).is_some_and(|(k, _)| k == key))
        {
            Some(line) => {
                debug!("Replacing cached host key {} in {}", key, self.path.display());
                *line = entry;
            }
            None => lines.push(entry),
        }

        self.write_lines(&lines).map_err(persist_err)
    }
}
