use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ControllerError;

pub const DEFAULT_GATEWAY_URL: &str = "http://gateway:8080";
pub const DEFAULT_SECRET_MOUNT_PATH: &str = "/var/secrets/";

/// Settings of the gateway side of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub gateway_url: String,
    /// Timeout of one function invocation.
    pub upstream_timeout: Duration,
    /// How often the topic → function map is rebuilt from the gateway.
    pub rebuild_interval: Duration,
    pub print_response: bool,
    pub print_response_body: bool,
    /// Separator inside the `topic` annotation of a function.
    pub topic_annotation_delimiter: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.into(),
            upstream_timeout: Duration::from_secs(30),
            rebuild_interval: Duration::from_secs(3),
            print_response: false,
            print_response_body: false,
            topic_annotation_delimiter: ",".into(),
        }
    }
}

/// Basic-auth credentials for the gateway, read from mounted secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct GatewayCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl GatewayCredentials {
    /// `basic_auth=true|1` enables reading `basic-auth-user` and
    /// `basic-auth-password` from `secret_mount_path`.
    pub fn from_env() -> Result<Option<Self>, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ControllerError> {
        let enabled = lookup("basic_auth").is_some_and(|v| v == "1" || v == "true");
        if !enabled {
            return Ok(None);
        }
        let mount = lookup("secret_mount_path")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SECRET_MOUNT_PATH.into());
        Self::read_from(Path::new(&mount)).map(Some)
    }

    pub fn read_from(dir: &Path) -> Result<Self, ControllerError> {
        Ok(Self {
            user: read_secret(dir.join("basic-auth-user"))?,
            password: read_secret(dir.join("basic-auth-password"))?,
        })
    }
}

fn read_secret(path: PathBuf) -> Result<String, ControllerError> {
    std::fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|source| ControllerError::Credentials { path: path.display().to_string(), source })
}
