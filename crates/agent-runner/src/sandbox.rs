//! OS-level isolation for agent processes

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::AgentRunnerError;
use crate::process::command_exists;

/// Namespace isolation helper probed for on Linux
pub const LINUX_HELPER: &str = "bwrap";
/// Profile-based sandbox tool shipped with macOS
pub const MACOS_HELPER: &str = "sandbox-exec";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Concrete isolation strategy for spawned agents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    IsolatedLinux,
    IsolatedMacos,
    #[default]
    Off,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsolatedLinux => "isolated-linux",
            Self::IsolatedMacos => "isolated-macos",
            Self::Off => "off",
        }
    }

    /// Rewrite an invocation so it runs inside this sandbox.
    ///
    /// Everything is readable; only `cwd`, the temp directory and
    /// `writable` may be written to.
    pub fn wrap(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
        writable: &[PathBuf],
    ) -> (String, Vec<String>) {
        match self {
            Self::Off => (command.to_string(), args.to_vec()),
            Self::IsolatedLinux => {
                let mut wrapped: Vec<String> = [
                    "--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect();
                for path in std::iter::once(cwd).chain(writable.iter().map(PathBuf::as_path)) {
                    let path = path.display().to_string();
                    wrapped.extend(["--bind".to_string(), path.clone(), path]);
                }
                wrapped.extend([
                    "--die-with-parent".to_string(),
                    "--chdir".to_string(),
                    cwd.display().to_string(),
                    "--".to_string(),
                    command.to_string(),
                ]);
                wrapped.extend(args.iter().cloned());
                (LINUX_HELPER.to_string(), wrapped)
            }
            Self::IsolatedMacos => {
                let mut wrapped = vec!["-p".to_string(), macos_profile(cwd, writable), command.to_string()];
                wrapped.extend(args.iter().cloned());
                (MACOS_HELPER.to_string(), wrapped)
            }
        }
    }
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn macos_profile(cwd: &Path, writable: &[PathBuf]) -> String {
    let mut profile = String::from(
        "(version 1)\n(allow default)\n(deny file-write*)\n(allow file-write*\n  (subpath \"/private/tmp\")\n  (subpath \"/private/var/folders\")\n  (subpath \"/dev\")",
    );
    for path in std::iter::once(cwd).chain(writable.iter().map(PathBuf::as_path)) {
        let escaped = path.display().to_string().replace('\\', "\\\\").replace('"', "\\\"");
        profile.push_str(&format!("\n  (subpath \"{}\")", escaped));
    }
    profile.push_str(")\n");
    profile
}

/// Requested isolation; `Auto` is resolved by [`SandboxDetector`] and never stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SandboxRequest {
    #[default]
    Auto,
    Mode(SandboxMode),
}

impl FromStr for SandboxRequest {
    type Err = AgentRunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "isolated-linux" | "linux" | "bwrap" => Ok(Self::Mode(SandboxMode::IsolatedLinux)),
            "isolated-macos" | "macos" | "sandbox-exec" => Ok(Self::Mode(SandboxMode::IsolatedMacos)),
            "off" | "none" | "false" => Ok(Self::Mode(SandboxMode::Off)),
            other => Err(AgentRunnerError::configuration(format!(
                "unknown sandbox mode '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for SandboxRequest {
    type Error = AgentRunnerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SandboxRequest> for String {
    fn from(request: SandboxRequest) -> Self {
        request.to_string()
    }
}

impl fmt::Display for SandboxRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Mode(mode) => f.write_str(mode.as_str()),
        }
    }
}

/// Operating system family, as far as sandboxing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" | "android" => Self::Linux,
            "macos" => Self::MacOs,
            _ => Self::Other,
        }
    }
}

/// Resolves a sandbox request to a concrete mode by probing for helpers
#[derive(Debug, Clone)]
pub struct SandboxDetector {
    os: HostOs,
    linux_helper: String,
    macos_helper: String,
    probe_timeout: Duration,
}

impl Default for SandboxDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxDetector {
    pub fn new() -> Self {
        Self {
            os: HostOs::current(),
            linux_helper: LINUX_HELPER.to_string(),
            macos_helper: MACOS_HELPER.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_os(mut self, os: HostOs) -> Self {
        self.os = os;
        self
    }

    pub fn with_helpers(mut self, linux: impl Into<String>, macos: impl Into<String>) -> Self {
        self.linux_helper = linux.into();
        self.macos_helper = macos.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Resolve a request; explicit modes pass through unchanged.
    ///
    /// Probing is not cached, every `Auto` request looks again.
    pub async fn resolve(&self, request: SandboxRequest) -> SandboxMode {
        match request {
            SandboxRequest::Mode(mode) => mode,
            SandboxRequest::Auto => self.detect().await,
        }
    }

    async fn detect(&self) -> SandboxMode {
        let (helper, mode) = match self.os {
            HostOs::Linux => (&self.linux_helper, SandboxMode::IsolatedLinux),
            HostOs::MacOs => (&self.macos_helper, SandboxMode::IsolatedMacos),
            HostOs::Other => {
                debug!("No sandbox support on this platform");
                return SandboxMode::Off;
            }
        };

        match command_exists(helper, self.probe_timeout).await {
            Some(path) => {
                info!("Sandboxing agents with {} ({:?})", helper, path);
                mode
            }
            None => {
                info!("{} not found, running agents without a sandbox", helper);
                SandboxMode::Off
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_mode_passes_through() {
        let detector = SandboxDetector::new().with_os(HostOs::Other);
        for mode in [SandboxMode::IsolatedLinux, SandboxMode::IsolatedMacos, SandboxMode::Off] {
            assert_eq!(detector.resolve(SandboxRequest::Mode(mode)).await, mode);
        }
    }

    #[tokio::test]
    async fn test_auto_on_unsupported_os_is_off() {
        let detector = SandboxDetector::new().with_os(HostOs::Other);
        assert_eq!(detector.resolve(SandboxRequest::Auto).await, SandboxMode::Off);
    }

    #[tokio::test]
    async fn test_auto_without_helper_is_off() {
        let missing = "definitely-not-a-sandbox-helper-4242";
        for os in [HostOs::Linux, HostOs::MacOs] {
            let detector = SandboxDetector::new()
                .with_os(os)
                .with_helpers(missing, missing)
                .with_probe_timeout(Duration::from_millis(500));
            assert_eq!(detector.resolve(SandboxRequest::Auto).await, SandboxMode::Off);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auto_with_present_helper() {
        // `sh` stands in for the helper binary
        let detector = SandboxDetector::new()
            .with_os(HostOs::Linux)
            .with_helpers("sh", "sh");
        assert_eq!(
            detector.resolve(SandboxRequest::Auto).await,
            SandboxMode::IsolatedLinux
        );
    }

    #[test]
    fn test_parse_request() {
        assert_eq!("auto".parse::<SandboxRequest>().unwrap(), SandboxRequest::Auto);
        assert_eq!(
            "bwrap".parse::<SandboxRequest>().unwrap(),
            SandboxRequest::Mode(SandboxMode::IsolatedLinux)
        );
        assert_eq!(
            "OFF".parse::<SandboxRequest>().unwrap(),
            SandboxRequest::Mode(SandboxMode::Off)
        );
        assert!("docker".parse::<SandboxRequest>().is_err());
    }

    #[test]
    fn test_wrap_off_is_identity() {
        let args = vec!["--print".to_string()];
        let (cmd, wrapped) = SandboxMode::Off.wrap("claude", &args, Path::new("/work"), &[]);
        assert_eq!(cmd, "claude");
        assert_eq!(wrapped, args);
    }

    #[test]
    fn test_wrap_linux() {
        let args = vec!["exec".to_string(), "--json".to_string()];
        let (cmd, wrapped) = SandboxMode::IsolatedLinux.wrap(
            "codex",
            &args,
            Path::new("/work/wt-1"),
            &[PathBuf::from("/home/me/.codex")],
        );
        assert_eq!(cmd, "bwrap");
        let joined = wrapped.join(" ");
        assert!(joined.contains("--ro-bind / /"));
        assert!(joined.contains("--bind /work/wt-1 /work/wt-1"));
        assert!(joined.contains("--bind /home/me/.codex /home/me/.codex"));
        assert!(joined.ends_with("--chdir /work/wt-1 -- codex exec --json"));
    }

    #[test]
    fn test_wrap_macos() {
        let (cmd, wrapped) =
            SandboxMode::IsolatedMacos.wrap("gemini", &[], Path::new("/Users/me/wt"), &[]);
        assert_eq!(cmd, "sandbox-exec");
        assert_eq!(wrapped[0], "-p");
        assert!(wrapped[1].contains("(deny file-write*)"));
        assert!(wrapped[1].contains("(subpath \"/Users/me/wt\")"));
        assert_eq!(wrapped[2], "gemini");
    }

    #[test]
    fn test_request_serializes_as_string() {
        let json = serde_json::to_string(&SandboxRequest::Auto).unwrap();
        assert_eq!(json, "\"auto\"");
        let parsed: SandboxRequest = serde_json::from_str("\"isolated-macos\"").unwrap();
        assert_eq!(parsed, SandboxRequest::Mode(SandboxMode::IsolatedMacos));
        assert!(serde_json::from_str::<SandboxRequest>("\"chroot\"").is_err());
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&SandboxMode::IsolatedLinux).unwrap();
        assert_eq!(json, "\"isolated-linux\"");
    }
}
