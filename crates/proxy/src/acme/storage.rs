//! Durable certificate store.
//!
//! ```text
//! storage/
//! ├── credentials.json      # ACME account credentials
//! └── domains/
//!     └── chat.example.com/
//!         ├── cert.pem      # certificate chain
//!         ├── key.pem       # private key
//!         └── meta.json     # expiry and issue time
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! crash mid-write never leaves a torn certificate behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::StorageError;

const CREDENTIALS_FILE: &str = "credentials.json";
const DOMAINS_DIR: &str = "domains";

/// Metadata kept next to each certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub host: String,
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
}

/// PEM material and metadata of one stored certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Host names double as directory names.
fn check_host(host: &str) -> Result<(), StorageError> {
    let valid = !host.is_empty()
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidHost(host.to_string()))
    }
}

fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), StorageError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    // a stale tmp file would keep its old mode
    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(io_error(&tmp)(e)),
        _ => {}
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp).map_err(io_error(&tmp))?;
    file.write_all(contents).map_err(io_error(&tmp))?;
    file.sync_all().map_err(io_error(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_error(path))
}

fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

impl CertificateStore {
    /// Open the store, creating its directories (mode 0700 on Unix).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        let domains = root.join(DOMAINS_DIR);
        fs::create_dir_all(&domains).map_err(io_error(&domains))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for dir in [&root, &domains] {
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(io_error(dir))?;
            }
        }

        info!(storage = %root.display(), "Opened certificate store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.root.join(DOMAINS_DIR).join(host)
    }

    /// Stored account credentials, if an account was registered before.
    pub fn load_credentials<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        let path = self.root.join(CREDENTIALS_FILE);
        let Some(content) = read_optional(&path)? else {
            trace!("No stored ACME account");
            return Ok(None);
        };
        let credentials = serde_json::from_str(&content).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        debug!("Loaded ACME account credentials");
        Ok(Some(credentials))
    }

    pub fn save_credentials<T: Serialize>(&self, credentials: &T) -> Result<(), StorageError> {
        let path = self.root.join(CREDENTIALS_FILE);
        let json = serde_json::to_vec_pretty(credentials).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json, true)?;
        info!("Saved ACME account credentials");
        Ok(())
    }

    pub fn load(&self, host: &str) -> Result<Option<StoredCertificate>, StorageError> {
        check_host(host)?;
        let dir = self.host_dir(host);

        let Some(cert_pem) = read_optional(&dir.join("cert.pem"))? else {
            trace!(host = %host, "No stored certificate");
            return Ok(None);
        };
        let Some(key_pem) = read_optional(&dir.join("key.pem"))? else {
            return Ok(None);
        };
        let meta_path = dir.join("meta.json");
        let Some(meta) = read_optional(&meta_path)? else {
            return Ok(None);
        };
        let meta: CertificateMeta = serde_json::from_str(&meta).map_err(|source| StorageError::Json {
            path: meta_path,
            source,
        })?;

        debug!(host = %host, expires = %meta.expires, "Loaded stored certificate");
        Ok(Some(StoredCertificate {
            cert_pem,
            key_pem,
            meta,
        }))
    }

    /// Persist a certificate. The key is written before the chain, and the
    /// metadata last, so a partial write is never loaded.
    pub fn save(&self, certificate: &StoredCertificate) -> Result<(), StorageError> {
        let host = &certificate.meta.host;
        check_host(host)?;
        let dir = self.host_dir(host);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        write_atomic(&dir.join("key.pem"), certificate.key_pem.as_bytes(), true)?;
        write_atomic(&dir.join("cert.pem"), certificate.cert_pem.as_bytes(), false)?;

        let meta_path = dir.join("meta.json");
        let meta = serde_json::to_vec_pretty(&certificate.meta).map_err(|source| StorageError::Json {
            path: meta_path.clone(),
            source,
        })?;
        write_atomic(&meta_path, &meta, false)?;

        info!(host = %host, expires = %certificate.meta.expires, "Stored certificate");
        Ok(())
    }

    /// Hosts with a stored certificate, sorted.
    pub fn hosts(&self) -> Result<Vec<String>, StorageError> {
        let domains = self.root.join(DOMAINS_DIR);
        let mut hosts = Vec::new();
        for entry in fs::read_dir(&domains).map_err(io_error(&domains))? {
            let entry = entry.map_err(io_error(&domains))?;
            if entry.path().join("meta.json").is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    hosts.push(name.to_string());
                }
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    pub fn remove(&self, host: &str) -> Result<(), StorageError> {
        check_host(host)?;
        let dir = self.host_dir(host);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(host = %host, "Removed stored certificate");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, CertificateStore) {
        let dir = TempDir::new().unwrap();
        let store = CertificateStore::open(dir.path().join("acme")).unwrap();
        (dir, store)
    }

    fn certificate(host: &str, days: i64) -> StoredCertificate {
        StoredCertificate {
            cert_pem: format!("cert for {host}"),
            key_pem: format!("key for {host}"),
            meta: CertificateMeta {
                host: host.to_string(),
                expires: Utc::now() + Duration::days(days),
                issued: Utc::now(),
            },
        }
    }

    #[test]
    fn test_open_creates_layout() {
        let (_dir, store) = store();
        assert!(store.root().join("domains").is_dir());
    }

    #[test]
    fn test_credentials_round_trip() {
        let (_dir, store) = store();
        assert_eq!(store.load_credentials::<serde_json::Value>().unwrap(), None);

        let credentials = serde_json::json!({ "id": "https://acme.test/acct/1" });
        store.save_credentials(&credentials).unwrap();
        assert_eq!(store.load_credentials::<serde_json::Value>().unwrap(), Some(credentials));
    }

    #[test]
    fn test_save_load_and_list() {
        let (_dir, store) = store();
        assert_eq!(store.load("chat.example.com").unwrap(), None);

        let chat = certificate("chat.example.com", 60);
        store.save(&chat).unwrap();
        store.save(&certificate("blog.example.com", 60)).unwrap();

        assert_eq!(store.load("chat.example.com").unwrap(), Some(chat));
        assert_eq!(store.hosts().unwrap(), vec!["blog.example.com", "chat.example.com"]);
        assert!(!store.root().join("domains/chat.example.com/cert.pem.tmp").exists());
    }

    #[test]
    fn test_survives_reopen() {
        let (dir, store) = store();
        store.save(&certificate("chat.example.com", 60)).unwrap();
        drop(store);

        let reopened = CertificateStore::open(dir.path().join("acme")).unwrap();
        assert!(reopened.load("chat.example.com").unwrap().is_some());
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store();
        store.save(&certificate("chat.example.com", 60)).unwrap();
        store.remove("chat.example.com").unwrap();
        assert_eq!(store.load("chat.example.com").unwrap(), None);
        store.remove("chat.example.com").unwrap();
    }

    #[test]
    fn test_rejects_path_like_hosts() {
        let (_dir, store) = store();
        for host in ["", "../etc", "a/b", ".hidden"] {
            assert!(matches!(store.load(host), Err(StorageError::InvalidHost(_))), "{host}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_key_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        store.save(&certificate("chat.example.com", 60)).unwrap();
        let mode = fs::metadata(store.root().join("domains/chat.example.com/key.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_tmp_key_does_not_keep_its_mode() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        let domain = store.root().join("domains/chat.example.com");
        fs::create_dir_all(&domain).unwrap();
        let stale = domain.join("key.pem.tmp");
        fs::write(&stale, "leftover").unwrap();
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o644)).unwrap();

        store.save(&certificate("chat.example.com", 60)).unwrap();

        let key = domain.join("key.pem");
        assert_eq!(fs::metadata(&key).unwrap().permissions().mode() & 0o777, 0o600);
        assert_eq!(fs::read_to_string(&key).unwrap(), "key for chat.example.com");
        assert!(!stale.exists());
    }
}
