//! Power through shell commands.
//!
//! `on-cmd` and `off-cmd` switch the target; `check-on` (optional) reads
//! the state back: exit 0 means on, 1 means off, anything else is unsure.
//! Without `check-on` the last commanded state is reported.

use std::process::{Command, Stdio};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{PowerController, PowerStatus};
use crate::DriverError;
use crate::registry::DriverSpec;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Options {
    on_cmd: String,
    off_cmd: String,
    #[serde(default)]
    check_on: Option<String>,
}

pub struct ShellCmdPower {
    on_cmd: String,
    off_cmd: String,
    check_on: Option<String>,
    /// Last state commanded through this controller.
    power_state: PowerStatus,
}

impl ShellCmdPower {
    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DriverError> {
        let opts: Options = spec.options("power")?;
        Ok(Self {
            on_cmd: opts.on_cmd,
            off_cmd: opts.off_cmd,
            check_on: opts.check_on,
            power_state: PowerStatus::Unsure,
        })
    }
}

/// Runs `command` through `sh -c` and returns its exit code.
fn run(command: &str) -> Result<Option<i32>, DriverError> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    debug!(command, code = ?status.code(), "power command finished");
    Ok(status.code())
}

fn run_checked(command: &str) -> Result<(), DriverError> {
    match run(command)? {
        Some(0) => Ok(()),
        code => Err(DriverError::Command {
            command: command.to_string(),
            status: match code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".into(),
            },
        }),
    }
}

impl PowerController for ShellCmdPower {
    fn on(&mut self) -> Result<bool, DriverError> {
        run_checked(&self.on_cmd)?;
        self.power_state = PowerStatus::On;
        Ok(self.status() == PowerStatus::On)
    }

    fn off(&mut self) -> Result<bool, DriverError> {
        run_checked(&self.off_cmd)?;
        self.power_state = PowerStatus::Off;
        Ok(self.status() == PowerStatus::Off)
    }

    fn status(&mut self) -> PowerStatus {
        let Some(check) = &self.check_on else {
            return self.power_state;
        };
        match run(check) {
            Ok(Some(0)) => PowerStatus::On,
            Ok(Some(1)) => PowerStatus::Off,
            Ok(_) => PowerStatus::Unsure,
            Err(e) => {
                warn!("check-on command failed: {e}");
                PowerStatus::Unsure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power(extra: &str) -> ShellCmdPower {
        let spec = DriverSpec::parse(&format!("variant = \"shellcmd\"\n{extra}")).unwrap();
        ShellCmdPower::from_spec(&spec).unwrap()
    }

    #[test]
    fn tracks_commanded_state_without_check() {
        let mut p = power("on-cmd = \"true\"\noff-cmd = \"true\"");
        assert_eq!(p.status(), PowerStatus::Unsure);
        assert!(p.on().unwrap());
        assert_eq!(p.status(), PowerStatus::On);
        assert_eq!(p.toggle().unwrap(), PowerStatus::Off);
    }

    #[test]
    fn check_on_reads_state_back() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("on");
        let flag = flag.display();
        let mut p = power(&format!(
            "on-cmd = \"touch {flag}\"\noff-cmd = \"rm -f {flag}\"\ncheck-on = \"test -e {flag}\""
        ));

        assert_eq!(p.status(), PowerStatus::Off);
        assert!(p.on().unwrap());
        assert_eq!(p.status(), PowerStatus::On);
        assert!(p.off().unwrap());
        assert_eq!(p.status(), PowerStatus::Off);
    }

    #[test]
    fn failing_command_is_an_error() {
        let mut p = power("on-cmd = \"exit 3\"\noff-cmd = \"true\"");
        match p.on() {
            Err(DriverError::Command { status, .. }) => assert_eq!(status, "exit code 3"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unexpected_check_code_is_unsure() {
        let mut p = power("on-cmd = \"true\"\noff-cmd = \"true\"\ncheck-on = \"exit 7\"");
        assert_eq!(p.status(), PowerStatus::Unsure);
    }

    #[test]
    fn missing_command_rejected() {
        let spec = DriverSpec::parse("variant = \"shellcmd\"\non-cmd = \"true\"").unwrap();
        assert!(ShellCmdPower::from_spec(&spec).is_err());
    }
}
