//! Entry points for callers that drive devices: run shell commands, move
//! files, manage packages and list the devices behind a bridge.
//!
//! Every call opens its own connection, so one [`BridgeClient`] can be
//! shared across threads.

use std::path::Path;

use tracing::{debug, info};

use crate::codec::control::decode_text;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::network::{ConnectionInfo, Transport};
use crate::protocol::control;
use crate::protocol::shell::{CollectingReceiver, Receiver, ShellOutcome, ShellRequest, ShellSession};
use crate::protocol::sync::{SyncChannel, join_remote, shell_quote};
use crate::state::device::{DeviceRecord, parse_device_list};
use crate::state::monitor::{DeviceMonitor, LIST_TARGETS_COMMAND, MonitorRegistry};

/// Device-side scratch directory packages are staged in before install.
pub const PACKAGE_STAGING_DIR: &str = "/data/local/tmp";

/// Control request that reboots the selected device.
pub const REBOOT_COMMAND: &str = "target boot";

#[derive(Debug, Clone, Default)]
pub struct BridgeClient {
    config: BridgeConfig,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.config.connection_info()
    }

    /// A request for `command` carrying the configured command timeout.
    pub fn shell_request(&self, command: impl Into<String>) -> ShellRequest {
        ShellRequest::new(command).with_timeout(self.config.command_timeout())
    }

    // ── Shell ────────────────────────────────────────────────────

    /// Run `request` on `serial`, streaming output into `receiver`.
    pub fn execute_shell(
        &self,
        serial: &str,
        request: &ShellRequest,
        receiver: &mut dyn Receiver,
    ) -> Result<ShellOutcome> {
        ShellSession::new(self.connection_info(), serial).execute(request, receiver)
    }

    /// Run `command` and return everything it printed.
    pub fn shell_output(&self, serial: &str, command: &str) -> Result<String> {
        let mut receiver = CollectingReceiver::new();
        self.execute_shell(serial, &self.shell_request(command), &mut receiver)?;
        Ok(receiver.into_output())
    }

    // ── Files ────────────────────────────────────────────────────

    /// Copy `local` (file or directory) to `remote` on `serial`.
    pub fn push_file(&self, serial: &str, local: &Path, remote: &str, create_top: bool) -> Result<()> {
        let mut channel = self.open_sync(serial)?;
        let result = channel.push_file(local, remote, create_top);
        channel.close();
        result
    }

    /// Copy `remote` (file or directory) from `serial` to `local`.
    pub fn pull_file(&self, serial: &str, remote: &str, local: &Path, create_top: bool) -> Result<()> {
        let mut channel = self.open_sync(serial)?;
        let result = channel.pull_file(remote, local, create_top);
        channel.close();
        result
    }

    fn open_sync(&self, serial: &str) -> Result<SyncChannel> {
        Ok(
            SyncChannel::open(&self.connection_info(), serial, self.config.transfer_timeout())?
                .with_shell_timeout(self.config.command_timeout()),
        )
    }

    // ── Packages ─────────────────────────────────────────────────

    /// Stage `package` on the device and install it with the bundle
    /// manager. The staged copy is removed afterwards.
    pub fn install_package(&self, serial: &str, package: &Path, replace: bool) -> Result<String> {
        let name = package
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BridgeError::local(
                    package,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "package path has no file name"),
                )
            })?;
        let staged = join_remote(PACKAGE_STAGING_DIR, &name);
        self.push_file(serial, package, &staged, false)?;

        let command = install_command(&staged, replace);
        info!(serial, %command, "installing package");
        let request = ShellRequest::new(command).with_timeout(self.config.transfer_timeout());
        let mut receiver = CollectingReceiver::new();
        let result = self.execute_shell(serial, &request, &mut receiver);

        let cleanup = format!("rm -f {}", shell_quote(&staged));
        if let Err(e) = self.shell_output(serial, &cleanup) {
            debug!(serial, error = %e, "could not remove staged package");
        }

        result?;
        check_package_output(receiver.into_output())
    }

    /// Remove the bundle named `bundle`.
    pub fn uninstall_package(&self, serial: &str, bundle: &str) -> Result<String> {
        let command = format!("bm uninstall -n {}", shell_quote(bundle));
        info!(serial, %command, "uninstalling package");
        check_package_output(self.shell_output(serial, &command)?)
    }

    // ── Control ──────────────────────────────────────────────────

    /// Ask `serial` to reboot.
    pub fn reboot(&self, serial: &str) -> Result<()> {
        let timeout = self.config.command_timeout();
        let mut transport = control::connect_device(&self.connection_info(), serial, serial, timeout)?;
        control::send_request(&mut transport, REBOOT_COMMAND, timeout)?;
        control::read_response(&mut transport, false, timeout)?.into_result()?;
        info!(serial, "reboot requested");
        Ok(())
    }

    /// One-shot query of the devices behind the bridge.
    pub fn list_targets(&self) -> Result<Vec<DeviceRecord>> {
        let info = self.connection_info();
        let timeout = self.config.command_timeout();
        let mut transport = Transport::open(&info, Some(timeout))?;
        control::handshake(&mut transport, &self.config.bridge.connect_key, timeout)?;
        control::send_request(&mut transport, LIST_TARGETS_COMMAND, timeout)?;
        let payload = control::read_frame(&mut transport, timeout)?.unwrap_or_default();
        Ok(parse_device_list(&decode_text(&payload), info.host(), info.port()))
    }

    /// The monitor for this client's bridge, created in `registry` if absent.
    pub fn monitor(&self, registry: &MonitorRegistry) -> std::sync::Arc<DeviceMonitor> {
        registry.get_or_create(
            &self.config.bridge.host,
            self.config.bridge.port,
            self.config.monitor_settings(),
        )
    }
}

fn install_command(remote: &str, replace: bool) -> String {
    let mut command = format!("bm install -p {}", shell_quote(remote));
    if replace {
        command.push_str(" -r");
    }
    command
}

/// Line prefixes the bundle manager uses to report a failed operation.
const PACKAGE_FAILURE_PREFIXES: [&str; 2] = ["error:", "failed to "];

/// The bundle manager reports failure in its output, not through the
/// protocol. Only whole lines are matched so bundle names and paths that
/// happen to contain "error" or "fail" pass.
fn check_package_output(output: String) -> Result<String> {
    let failed = output.lines().any(|line| {
        let line = line.trim_start().to_ascii_lowercase();
        PACKAGE_FAILURE_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
    });
    if failed {
        return Err(BridgeError::CommandRejected(output.trim().to_string()));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_command_flags() {
        assert_eq!(install_command("/data/local/tmp/a.hap", false), "bm install -p '/data/local/tmp/a.hap'");
        assert_eq!(
            install_command("/data/local/tmp/a.hap", true),
            "bm install -p '/data/local/tmp/a.hap' -r"
        );
    }

    #[test]
    fn package_output_failure_is_rejection() {
        assert!(check_package_output("install bundle successfully.\n".into()).is_ok());
        let err = check_package_output("error: install failed due to grant request permissions failed\n".into())
            .unwrap_err();
        assert!(matches!(err, BridgeError::CommandRejected(_)));
        let err = check_package_output("failed to install bundle.\nerror: install parse failed.\n".into())
            .unwrap_err();
        assert!(matches!(err, BridgeError::CommandRejected(ref m) if m.starts_with("failed to install")));
    }

    #[test]
    fn package_names_mentioning_failure_are_not_rejections() {
        for output in [
            "uninstall bundle successfully.\n",
            "install bundle successfully. bundle: com.example.failover\n",
            "installed /data/local/tmp/error-reporter.hap\nuninstall bundle successfully.\n",
        ] {
            assert!(check_package_output(output.into()).is_ok(), "{output:?}");
        }
    }

    #[test]
    fn client_uses_configured_endpoint() {
        let mut config = BridgeConfig::default();
        config.bridge.host = "10.1.2.3".into();
        config.bridge.port = 9000;
        let client = BridgeClient::new(config);
        assert_eq!(client.connection_info().to_string(), "10.1.2.3:9000");
        assert_eq!(client.shell_request("id").timeout, client.config().command_timeout());
    }

    #[test]
    fn monitor_comes_from_registry() {
        let registry = MonitorRegistry::new();
        let client = BridgeClient::default();
        let a = client.monitor(&registry);
        let b = client.monitor(&registry);
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }
}
