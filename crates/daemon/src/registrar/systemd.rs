//! systemd backend for the service registrar.
//!
//! A spec becomes two units in the unit directory:
//!
//! - `<label>.socket`: binds the socket path and names the descriptor
//! - `<label>.service`: runs the program when the first client connects
//!
//! Only the socket unit is enabled, so nothing runs until a client connects.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{DaemonSpec, RegistrationError, ServiceRegistrar};
use crate::activation::ACTIVATION_ENV;
use crate::config::ServiceConfig;

/// Permissions of the installed executable.
const PROGRAM_MODE: u32 = 0o755;

/// Runs service manager requests such as `daemon-reload` or `enable`.
pub trait UnitManager: Send + Sync + fmt::Debug {
    /// Run one `systemctl` request.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool is missing or the request fails.
    fn run(&self, args: &[&str]) -> Result<(), RegistrationError>;
}

/// [`UnitManager`] backed by the `systemctl` executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Systemctl;

impl UnitManager for Systemctl {
    fn run(&self, args: &[&str]) -> Result<(), RegistrationError> {
        let tool = which::which("systemctl").map_err(|source| RegistrationError::ToolMissing {
            tool: "systemctl",
            source,
        })?;

        debug!("Running systemctl {}", args.join(" "));
        let mut command = Command::new(&tool);
        command.args(args);
        for var in ACTIVATION_ENV {
            command.env_remove(var);
        }
        let output = command
            .output()
            .map_err(|e| RegistrationError::io(&tool, e))?;

        if !output.status.success() {
            return Err(RegistrationError::Systemctl {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Registers services as systemd units.
#[derive(Debug, Clone)]
pub struct SystemdRegistrar {
    unit_dir: PathBuf,
    units: Option<Arc<dyn UnitManager>>,
}

impl SystemdRegistrar {
    /// Create a registrar writing units into `unit_dir`.
    ///
    /// With `manage_units` unset, no `systemctl` command is run.
    pub fn new(unit_dir: impl Into<PathBuf>, manage_units: bool) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            units: manage_units.then(|| Arc::new(Systemctl) as Arc<dyn UnitManager>),
        }
    }

    /// Create a registrar from the `[service]` configuration section.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.unit_dir, config.manage_units)
    }

    /// Send service manager requests to `units`.
    pub fn with_unit_manager(mut self, units: Arc<dyn UnitManager>) -> Self {
        self.units = Some(units);
        self
    }

    /// Path of the service unit for `spec`.
    pub fn service_unit_path(&self, spec: &DaemonSpec) -> PathBuf {
        self.unit_dir.join(format!("{}.service", spec.label))
    }

    /// Path of the socket unit for `spec`.
    pub fn socket_unit_path(&self, spec: &DaemonSpec) -> PathBuf {
        self.unit_dir.join(format!("{}.socket", spec.label))
    }

    fn install_program(&self, spec: &DaemonSpec, source: &Path) -> Result<(), RegistrationError> {
        if let Some(parent) = spec.program.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistrationError::io(parent, e))?;
        }

        if source != spec.program {
            fs::copy(source, &spec.program).map_err(|e| RegistrationError::io(source, e))?;
        }
        fs::set_permissions(&spec.program, fs::Permissions::from_mode(PROGRAM_MODE))
            .map_err(|e| RegistrationError::io(&spec.program, e))?;

        debug!("Installed {} to {}", source.display(), spec.program.display());
        Ok(())
    }
}

impl ServiceRegistrar for SystemdRegistrar {
    fn install(&self, spec: &DaemonSpec, source: &Path) -> Result<(), RegistrationError> {
        let socket_unit = generate_socket_unit(spec)?;
        let service_unit = generate_service_unit(spec);

        self.install_program(spec, source)?;

        fs::create_dir_all(&self.unit_dir).map_err(|e| RegistrationError::io(&self.unit_dir, e))?;

        let socket_path = self.socket_unit_path(spec);
        fs::write(&socket_path, socket_unit).map_err(|e| RegistrationError::io(&socket_path, e))?;

        let service_path = self.service_unit_path(spec);
        fs::write(&service_path, service_unit)
            .map_err(|e| RegistrationError::io(&service_path, e))?;

        if let Some(units) = &self.units {
            units.run(&["daemon-reload"])?;
            units.run(&["enable", &format!("{}.socket", spec.label)])?;
            if spec.run_at_load {
                units.run(&["enable", &format!("{}.service", spec.label)])?;
            }
        }

        info!(label = %spec.label, "Service installed");
        Ok(())
    }

    fn uninstall(&self, spec: &DaemonSpec) -> Result<(), RegistrationError> {
        if !self.is_installed(spec) {
            return Err(RegistrationError::NotFound {
                label: spec.label.clone(),
            });
        }

        // Disabling only drops symlinks; nothing running is touched
        if let Some(units) = &self.units {
            for unit in [
                format!("{}.service", spec.label),
                format!("{}.socket", spec.label),
            ] {
                if let Err(e) = units.run(&["disable", &unit]) {
                    warn!("Continuing uninstall: {}", e);
                }
            }
        }

        for path in [self.socket_unit_path(spec), self.service_unit_path(spec)] {
            remove_if_present(&path)?;
        }
        remove_if_present(&spec.program)?;

        if let Some(units) = &self.units {
            units.run(&["daemon-reload"])?;
        }

        info!(label = %spec.label, "Service uninstalled");
        Ok(())
    }

    fn stop(&self, spec: &DaemonSpec) -> Result<(), RegistrationError> {
        let Some(units) = &self.units else {
            return Ok(());
        };

        // The service requires the socket, so stopping either ends the
        // service, which may be the caller
        units.run(&[
            "stop",
            "--no-block",
            &format!("{}.service", spec.label),
            &format!("{}.socket", spec.label),
        ])?;
        debug!(label = %spec.label, "Queued stop");
        Ok(())
    }

    fn is_installed(&self, spec: &DaemonSpec) -> bool {
        self.socket_unit_path(spec).exists() || self.service_unit_path(spec).exists()
    }
}

fn remove_if_present(path: &Path) -> Result<(), RegistrationError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RegistrationError::io(path, e)),
    }
}

/// Quote an `ExecStart=` word if it contains whitespace or quotes.
fn quote_exec_arg(arg: &str) -> String {
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Generate the socket unit for `spec`.
///
/// # Errors
///
/// systemd names every descriptor of a socket unit alike, so a `DaemonSpec` must
/// carry exactly one socket.
pub fn generate_socket_unit(spec: &DaemonSpec) -> Result<String, RegistrationError> {
    let mut sockets = spec.sockets.iter();
    let (name, path) = match (sockets.next(), sockets.next()) {
        (Some(socket), None) => socket,
        _ => {
            return Err(RegistrationError::InvalidSpec(format!(
                "expected exactly one socket, got {}",
                spec.sockets.len()
            )))
        }
    };

    Ok(format!(
        r#"[Unit]
Description={label} socket

[Socket]
ListenStream={path}
FileDescriptorName={name}
SocketMode=0666
Service={label}.service

[Install]
WantedBy=sockets.target
"#,
        label = spec.label,
        path = path.display(),
        name = name,
    ))
}

/// Generate the service unit for `spec`.
pub fn generate_service_unit(spec: &DaemonSpec) -> String {
    let exec_start = std::iter::once(spec.program.display().to_string())
        .chain(spec.program_arguments.iter().cloned())
        .map(|arg| quote_exec_arg(&arg))
        .collect::<Vec<_>>()
        .join(" ");

    let mut unit = format!(
        r#"[Unit]
Description={label}
Requires={label}.socket
After={label}.socket

[Service]
Type=notify
ExecStart={exec_start}
StandardOutput=append:{stdout}
StandardError=append:{stderr}
"#,
        label = spec.label,
        exec_start = exec_start,
        stdout = spec.stdout_path.display(),
        stderr = spec.stderr_path.display(),
    );

    if spec.run_at_load {
        unit.push_str("\n[Install]\nWantedBy=multi-user.target\n");
    }

    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn test_spec(dir: &TempDir) -> DaemonSpec {
        let mut sockets = BTreeMap::new();
        sockets.insert(
            "ListenSocket".to_string(),
            PathBuf::from("/var/tmp/cfdevd.socket"),
        );

        DaemonSpec {
            label: "org.cloudfoundry.cfdevd".to_string(),
            program: dir.path().join("libexec").join("org.cloudfoundry.cfdevd"),
            program_arguments: Vec::new(),
            run_at_load: false,
            sockets,
            stdout_path: PathBuf::from("/var/tmp/cfdevd.stdout.log"),
            stderr_path: PathBuf::from("/var/tmp/cfdevd.stderr.log"),
        }
    }

    fn fake_binary(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("cfdevd-build");
        fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        path
    }

    #[test]
    fn test_socket_unit_contents() {
        let dir = tempdir().unwrap();
        let unit = generate_socket_unit(&test_spec(&dir)).unwrap();

        assert!(unit.contains("[Socket]"));
        assert!(unit.contains("ListenStream=/var/tmp/cfdevd.socket"));
        assert!(unit.contains("FileDescriptorName=ListenSocket"));
        assert!(unit.contains("SocketMode=0666"));
        assert!(unit.contains("Service=org.cloudfoundry.cfdevd.service"));
        assert!(unit.contains("WantedBy=sockets.target"));
    }

    #[test]
    fn test_socket_unit_requires_one_socket() {
        let dir = tempdir().unwrap();
        let mut spec = test_spec(&dir);
        spec.sockets
            .insert("Second".to_string(), PathBuf::from("/var/tmp/second.socket"));

        let err = generate_socket_unit(&spec).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidSpec(_)));

        spec.sockets.clear();
        assert!(generate_socket_unit(&spec).is_err());
    }

    #[test]
    fn test_service_unit_contents() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let unit = generate_service_unit(&spec);

        assert!(unit.contains("Type=notify"));
        assert!(unit.contains(&format!("ExecStart={}", spec.program.display())));
        assert!(unit.contains("StandardOutput=append:/var/tmp/cfdevd.stdout.log"));
        assert!(unit.contains("StandardError=append:/var/tmp/cfdevd.stderr.log"));
        assert!(unit.contains("Requires=org.cloudfoundry.cfdevd.socket"));
        assert!(!unit.contains("[Install]"));
    }

    #[test]
    fn test_service_unit_arguments_and_run_at_load() {
        let dir = tempdir().unwrap();
        let mut spec = test_spec(&dir);
        spec.program = PathBuf::from("/opt/cf dev/cfdevd");
        spec.program_arguments = vec!["--config".to_string(), "/etc/cfdevd/config.toml".to_string()];
        spec.run_at_load = true;

        let unit = generate_service_unit(&spec);
        assert!(unit.contains(
            "ExecStart=\"/opt/cf dev/cfdevd\" --config /etc/cfdevd/config.toml"
        ));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn test_quote_exec_arg() {
        assert_eq!(quote_exec_arg("plain"), "plain");
        assert_eq!(quote_exec_arg("two words"), "\"two words\"");
        assert_eq!(quote_exec_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_exec_arg(""), "\"\"");
    }

    #[test]
    fn test_install_writes_units_and_program() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let registrar = SystemdRegistrar::new(dir.path().join("units"), false);

        assert!(!registrar.is_installed(&spec));
        registrar.install(&spec, &fake_binary(&dir)).unwrap();
        assert!(registrar.is_installed(&spec));

        let socket_unit = fs::read_to_string(registrar.socket_unit_path(&spec)).unwrap();
        assert_eq!(socket_unit, generate_socket_unit(&spec).unwrap());

        let service_unit = fs::read_to_string(registrar.service_unit_path(&spec)).unwrap();
        assert_eq!(service_unit, generate_service_unit(&spec));

        let mode = fs::metadata(&spec.program).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, PROGRAM_MODE);
        assert_eq!(fs::read(&spec.program).unwrap(), b"#!/bin/sh\nexit 0\n");
    }

    #[test]
    fn test_install_then_uninstall_twice() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let registrar = SystemdRegistrar::new(dir.path().join("units"), false);

        registrar.install(&spec, &fake_binary(&dir)).unwrap();
        registrar.uninstall(&spec).unwrap();

        assert!(!registrar.is_installed(&spec));
        assert!(!registrar.socket_unit_path(&spec).exists());
        assert!(!registrar.service_unit_path(&spec).exists());
        assert!(!spec.program.exists());

        let err = registrar.uninstall(&spec).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_install_missing_source() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let registrar = SystemdRegistrar::new(dir.path().join("units"), false);

        let err = registrar
            .install(&spec, &dir.path().join("does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Io { .. }));
        assert!(!registrar.is_installed(&spec));
    }

    /// Records requests together with whether the socket unit file existed.
    #[derive(Debug)]
    struct RecordingUnits {
        watched: PathBuf,
        fail_disable: bool,
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingUnits {
        fn new(watched: PathBuf) -> Self {
            Self {
                watched,
                fail_disable: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    impl UnitManager for RecordingUnits {
        fn run(&self, args: &[&str]) -> Result<(), RegistrationError> {
            self.calls
                .lock()
                .unwrap()
                .push((args.join(" "), self.watched.exists()));
            if self.fail_disable && args[0] == "disable" {
                return Err(RegistrationError::Systemctl {
                    args: args.join(" "),
                    stderr: "unit not found".to_string(),
                });
            }
            Ok(())
        }
    }

    fn managed(
        dir: &TempDir,
        spec: &DaemonSpec,
        fail_disable: bool,
    ) -> (SystemdRegistrar, Arc<RecordingUnits>) {
        let registrar = SystemdRegistrar::new(dir.path().join("units"), false);
        let mut units = RecordingUnits::new(registrar.socket_unit_path(spec));
        units.fail_disable = fail_disable;
        let units = Arc::new(units);
        (registrar.with_unit_manager(units.clone()), units)
    }

    #[test]
    fn test_install_enables_socket_only() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let (registrar, units) = managed(&dir, &spec, false);

        registrar.install(&spec, &fake_binary(&dir)).unwrap();
        assert_eq!(
            units.requests(),
            vec!["daemon-reload", "enable org.cloudfoundry.cfdevd.socket"]
        );
    }

    #[test]
    fn test_uninstall_never_stops_before_files_are_gone() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let (registrar, units) = managed(&dir, &spec, false);
        registrar.install(&spec, &fake_binary(&dir)).unwrap();
        units.calls.lock().unwrap().clear();

        registrar.uninstall(&spec).unwrap();
        assert!(!registrar.is_installed(&spec));
        assert!(!spec.program.exists());

        let calls = units.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("disable org.cloudfoundry.cfdevd.service".to_string(), true),
                ("disable org.cloudfoundry.cfdevd.socket".to_string(), true),
                ("daemon-reload".to_string(), false),
            ]
        );
        assert!(calls.iter().all(|(c, _)| !c.starts_with("stop")));
    }

    #[test]
    fn test_stop_is_queued_for_both_units() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let (registrar, units) = managed(&dir, &spec, false);

        registrar.stop(&spec).unwrap();
        assert_eq!(
            units.requests(),
            vec!["stop --no-block org.cloudfoundry.cfdevd.service org.cloudfoundry.cfdevd.socket"]
        );
    }

    #[test]
    fn test_uninstall_continues_when_disable_fails() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let (registrar, units) = managed(&dir, &spec, true);
        registrar.install(&spec, &fake_binary(&dir)).unwrap();

        registrar.uninstall(&spec).unwrap();
        assert!(!registrar.is_installed(&spec));
        assert_eq!(units.requests().last().unwrap(), "daemon-reload");
    }

    #[test]
    fn test_unmanaged_stop_is_noop() {
        let dir = tempdir().unwrap();
        let spec = test_spec(&dir);
        let registrar = SystemdRegistrar::new(dir.path().join("units"), false);
        assert!(registrar.stop(&spec).is_ok());
    }

    #[test]
    fn test_from_config() {
        let config = ServiceConfig::default();
        let registrar = SystemdRegistrar::from_config(&config);
        let spec = DaemonSpec::from_config(&crate::config::Config::default());

        assert_eq!(
            registrar.service_unit_path(&spec),
            PathBuf::from("/etc/systemd/system/org.cloudfoundry.cfdevd.service")
        );
        assert_eq!(
            registrar.socket_unit_path(&spec),
            PathBuf::from("/etc/systemd/system/org.cloudfoundry.cfdevd.socket")
        );
    }
}
