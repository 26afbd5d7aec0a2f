//! Agent process options

use std::path::PathBuf;
use std::time::Duration;

/// Options resolved from the command line before the agent starts.
#[derive(Debug, Clone)]
pub struct PipedOptions {
    /// Path to the Piped configuration file
    pub config_file: PathBuf,

    /// Port of the admin HTTP server
    pub admin_port: u16,

    /// How long to wait for graceful shutdown
    pub grace_period: Duration,

    /// Disable transport security towards the control plane
    pub insecure: bool,

    /// TLS certificate to trust instead of the system store
    pub cert_file: Option<String>,

    /// Directory where needed tools such as kubectl, helm, kustomize live
    pub tools_dir: PathBuf,

    /// Directory for Git working copies and deploy sources
    pub work_dir: PathBuf,
}

impl Default for PipedOptions {
    fn default() -> Self {
        let home = piped_home();
        Self {
            config_file: PathBuf::new(),
            admin_port: 9085,
            grace_period: Duration::from_secs(30),
            insecure: false,
            cert_file: None,
            tools_dir: home.join("tools"),
            work_dir: home.join("work"),
        }
    }
}

/// The agent's home directory, `$HOME/.piped`.
pub fn piped_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".piped")
}
