//! Bilibili credentials and their on-disk JSON store.
//!
//! The store is a flat JSON object:
//!
//! ```json
//! {
//!     "sessdata": "",
//!     "bili_jct": "",
//!     "buvid3": "",
//!     "dedeuserid": "",
//!     "ac_time_value": ""
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DanmakuError, Result};

/// Authentication token set for one logged-in user.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// `SESSDATA` session cookie.
    #[serde(default)]
    pub sessdata: String,
    /// `bili_jct` cookie, used as the CSRF token.
    #[serde(default)]
    pub bili_jct: String,
    /// Device identifier cookie.
    #[serde(default)]
    pub buvid3: String,
    /// Numeric user id (`DedeUserID`).
    #[serde(default)]
    pub dedeuserid: String,
    /// Refresh token used to renew the session cookies.
    #[serde(default)]
    pub ac_time_value: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(v: &str) -> &'static str {
            if v.is_empty() { "<empty>" } else { "<redacted>" }
        }
        f.debug_struct("Credentials")
            .field("sessdata", &redact(&self.sessdata))
            .field("bili_jct", &redact(&self.bili_jct))
            .field("buvid3", &self.buvid3)
            .field("dedeuserid", &self.dedeuserid)
            .field("ac_time_value", &redact(&self.ac_time_value))
            .finish()
    }
}

impl Credentials {
    pub fn new(
        sessdata: impl Into<String>,
        bili_jct: impl Into<String>,
        buvid3: impl Into<String>,
        dedeuserid: impl Into<String>,
    ) -> Self {
        Self {
            sessdata: sessdata.into(),
            bili_jct: bili_jct.into(),
            buvid3: buvid3.into(),
            dedeuserid: dedeuserid.into(),
            ac_time_value: String::new(),
        }
    }

    /// Parse a browser cookie string (`SESSDATA=..; bili_jct=..; ...`).
    pub fn from_cookie_str(cookies: &str) -> Self {
        let get = |name: &str| extract_cookie_value(cookies, name).unwrap_or_default();
        Self {
            sessdata: get("SESSDATA"),
            bili_jct: get("bili_jct"),
            buvid3: get("buvid3"),
            dedeuserid: get("DedeUserID"),
            ac_time_value: get("ac_time_value"),
        }
    }

    /// An empty `sessdata` means nobody is logged in.
    pub fn is_authenticated(&self) -> bool {
        !self.sessdata.trim().is_empty()
    }

    /// Fail with [`DanmakuError::Auth`] unless both session cookie and CSRF
    /// token are present.
    pub fn validate(&self) -> Result<()> {
        if !self.is_authenticated() {
            return Err(DanmakuError::auth("sessdata is empty, login required"));
        }
        if self.bili_jct.trim().is_empty() {
            return Err(DanmakuError::auth("bili_jct is empty, login required"));
        }
        Ok(())
    }

    /// Numeric user id, if present and parseable.
    pub fn uid(&self) -> Option<u64> {
        self.dedeuserid.trim().parse().ok()
    }

    /// CSRF token for write APIs.
    pub fn csrf(&self) -> &str {
        &self.bili_jct
    }

    /// `buvid3`, or a freshly generated one when the store has none.
    pub fn buvid3_or_generate(&self) -> String {
        if self.buvid3.trim().is_empty() {
            generate_fake_buvid3()
        } else {
            self.buvid3.clone()
        }
    }

    /// Build the `Cookie` header for HTTP requests.
    pub fn cookie_header(&self) -> String {
        let mut parts = vec![format!("buvid3={}", self.buvid3_or_generate())];
        if !self.sessdata.is_empty() {
            parts.push(format!("SESSDATA={}", self.sessdata));
        }
        if !self.bili_jct.is_empty() {
            parts.push(format!("bili_jct={}", self.bili_jct));
        }
        if !self.dedeuserid.is_empty() {
            parts.push(format!("DedeUserID={}", self.dedeuserid));
        }
        parts.join("; ")
    }
}

/// Extract a specific cookie value from a cookie string.
pub fn extract_cookie_value(cookies: &str, name: &str) -> Option<String> {
    for cookie in cookies.split(';') {
        let parts: Vec<&str> = cookie.trim().splitn(2, '=').collect();
        if parts.len() == 2 && parts[0] == name {
            return Some(parts[1].to_string());
        }
    }
    None
}

/// Generates a fake BUVID3 identifier.
///
/// Format: `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXinfoc` with uppercase hex digits.
pub fn generate_fake_buvid3() -> String {
    let u = uuid::Uuid::new_v4();
    let u_str = u.to_string().to_uppercase().replace('-', "");
    format!(
        "{}-{}-{}-{}-{}infoc",
        &u_str[0..8],
        &u_str[8..12],
        &u_str[12..16],
        &u_str[16..20],
        &u_str[20..]
    )
}

/// JSON file holding one [`Credentials`] record.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credentials, writing an empty record first if the
    /// file does not exist yet.
    pub async fn load_or_create(&self) -> Result<Credentials> {
        match tokio::fs::try_exists(&self.path).await? {
            true => self.load().await,
            false => {
                info!(path = %self.path.display(), "Credential file not found, creating an empty one");
                let credentials = Credentials::default();
                self.save(&credentials).await?;
                Ok(credentials)
            }
        }
    }

    pub async fn load(&self) -> Result<Credentials> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let credentials: Credentials = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), authenticated = credentials.is_authenticated(), "Loaded credentials");
        Ok(credentials)
    }

    pub async fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(credentials)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_cookie_str() {
        let creds = Credentials::from_cookie_str("SESSDATA=abc; bili_jct=xyz; DedeUserID=42");
        assert_eq!(creds.sessdata, "abc");
        assert_eq!(creds.bili_jct, "xyz");
        assert_eq!(creds.uid(), Some(42));
        assert!(creds.buvid3.is_empty());
    }

    #[test]
    fn test_validate_requires_sessdata_and_csrf() {
        let empty = Credentials::default();
        assert!(matches!(empty.validate(), Err(DanmakuError::Auth(_))));

        let no_csrf = Credentials::new("sess", "", "", "1");
        assert!(matches!(no_csrf.validate(), Err(DanmakuError::Auth(_))));

        let ok = Credentials::new("sess", "jct", "", "1");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_cookie_header_generates_buvid3_when_missing() {
        let creds = Credentials::new("sess", "jct", "", "7");
        let header = creds.cookie_header();
        assert!(header.starts_with("buvid3="));
        assert!(header.contains("infoc"));
        assert!(header.contains("SESSDATA=sess"));
        assert!(header.contains("bili_jct=jct"));
        assert!(header.contains("DedeUserID=7"));
    }

    #[test]
    fn test_cookie_header_keeps_stored_buvid3() {
        let creds = Credentials::new("sess", "jct", "provided", "7");
        assert!(creds.cookie_header().starts_with("buvid3=provided; "));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials::new("secret-sess", "secret-jct", "b", "1");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret-sess"));
        assert!(!debug.contains("secret-jct"));
    }

    #[test]
    fn test_fake_buvid3_format() {
        let buvid = generate_fake_buvid3();
        assert!(buvid.ends_with("infoc"));
        assert_eq!(buvid.len(), 36 + "infoc".len());
    }

    #[tokio::test]
    async fn test_store_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credential.json"));

        let creds = store.load_or_create().await.unwrap();
        assert!(!creds.is_authenticated());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        for key in ["sessdata", "bili_jct", "buvid3", "dedeuserid", "ac_time_value"] {
            assert_eq!(json.get(key).and_then(|v| v.as_str()), Some(""));
        }
    }

    #[tokio::test]
    async fn test_store_round_trips_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nested").join("credential.json"));

        let creds = Credentials::new("sess", "jct", "buvid", "99");
        store.save(&creds).await.unwrap();

        let loaded = store.load_or_create().await.unwrap();
        assert_eq!(loaded, creds);
    }
}
