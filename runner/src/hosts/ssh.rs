use super::{claimed_marker_name, is_visible, Credentials, HostError, RemoteHost};
use crate::{
    config::RemoteConfig,
    process::{run_with_timeout, CommandOutput},
};
use std::{fs, io::ErrorKind, path::Path, process::Command, time::Duration};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct SshOptions {
    /// upper bound for any single ssh/scp invocation
    pub command_timeout: Duration,
    pub connect_timeout_secs: u64,
    /// probe liveness with ICMP ping instead of a no-op ssh command
    pub ping: bool,
    pub ping_count: u32,
}

impl SshOptions {
    pub fn load(config: &RemoteConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(config.transfer.command_timeout_secs),
            connect_timeout_secs: config.transfer.connect_timeout_secs,
            ping: config.acquire.ping,
            ping_count: config.acquire.ping_count,
        }
    }
}

/// Remote host driven through the system `ssh`, `scp` and `ping` binaries
#[derive(Debug, Clone)]
pub struct SshHost {
    address: String,
    credentials: Credentials,
    options: SshOptions,
}

/// single-quote a value for the remote shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl SshHost {
    pub fn new(address: String, credentials: Credentials, options: SshOptions) -> Self {
        Self {
            address,
            credentials,
            options,
        }
    }

    fn destination(&self) -> String {
        match self.credentials.user {
            Some(ref user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }

    fn remote(&self, path: &str) -> String {
        format!("{}:{}", self.destination(), path)
    }

    /// options shared by ssh and scp, which only differ in the port flag
    fn common_args(&self, command: &mut Command, port_flag: &str) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.options.connect_timeout_secs))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");

        if let Some(ref identity) = self.credentials.identity_file {
            command.arg("-i").arg(identity);
        }
        if let Some(port) = self.credentials.port {
            command.arg(port_flag).arg(port.to_string());
        }
    }

    fn run(&self, command: Command) -> Result<CommandOutput, HostError> {
        run_with_timeout(command, self.options.command_timeout, None).map_err(|source| {
            HostError::Process {
                host: self.address.clone(),
                source,
            }
        })
    }

    fn ssh(&self, remote_command: &str) -> Result<CommandOutput, HostError> {
        let mut command = Command::new("ssh");
        self.common_args(&mut command, "-p");
        command.arg(self.destination()).arg(remote_command);

        trace!(host = %self.address, command = remote_command, "Running remote command");

        self.run(command)
    }

    fn failed(&self, command: &str, output: &CommandOutput) -> HostError {
        HostError::CommandFailed {
            host: self.address.clone(),
            command: command.to_owned(),
            status: output.code(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    fn ssh_checked(&self, remote_command: &str) -> Result<String, HostError> {
        let output = self.ssh(remote_command)?;

        if output.success() {
            Ok(output.stdout)
        } else {
            Err(self.failed(remote_command, &output))
        }
    }

    /// Remote commands answering yes/no through exit codes 0/1
    ///
    /// ssh itself reports connection problems as 255.
    fn ssh_predicate(&self, remote_command: &str) -> Result<bool, HostError> {
        let output = self.ssh(remote_command)?;

        match output.code() {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(self.failed(remote_command, &output)),
        }
    }

    fn scp(&self, from: &str, to: &str, recursive: bool) -> Result<(), HostError> {
        let mut command = Command::new("scp");
        self.common_args(&mut command, "-P");
        if recursive {
            command.arg("-r");
        }
        command.arg("-q").arg(from).arg(to);

        let output = self.run(command)?;
        if output.success() {
            Ok(())
        } else {
            Err(self.failed(&format!("scp {from} {to}"), &output))
        }
    }
}

impl RemoteHost for SshHost {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_alive(&self) -> bool {
        let result = if self.options.ping {
            let mut command = Command::new("ping");
            command
                .arg("-c")
                .arg(self.options.ping_count.max(1).to_string())
                .arg(&self.address);

            self.run(command).map(|output| output.success())
        } else {
            self.ssh("true").map(|output| output.success())
        };

        match result {
            Ok(alive) => alive,
            Err(error) => {
                debug!(host = %self.address, error = ?error, "Liveness probe failed");

                false
            }
        }
    }

    fn exists(&self, path: &str) -> Result<bool, HostError> {
        self.ssh_predicate(&format!("test -e {}", shell_quote(path)))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, HostError> {
        let quoted = shell_quote(path);
        let stdout =
            self.ssh_checked(&format!("if [ -d {quoted} ]; then ls -1A {quoted}; fi"))?;

        let mut names = stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && is_visible(name))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }

    fn claim_marker(&self, marker: &str, token: &str) -> Result<bool, HostError> {
        let claimed = shell_quote(&claimed_marker_name(marker, token));

        // mv is the atomic step, a vanished marker makes it exit 1
        self.ssh_predicate(&format!(
            "mv {} {claimed} 2>/dev/null && rm -f {claimed}",
            shell_quote(marker)
        ))
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), HostError> {
        if let Some((parent, _)) = remote.rsplit_once('/') {
            self.ssh_checked(&format!("mkdir -p {}", shell_quote(parent)))?;
        }

        self.scp(&local.to_string_lossy(), &self.remote(remote), false)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), HostError> {
        self.ssh_checked(&format!("mv {} {}", shell_quote(from), shell_quote(to)))
            .map(|_| ())
    }

    fn download_dir(&self, remote: &str, local: &Path) -> Result<(), HostError> {
        let io_error = |source| HostError::Io {
            host: self.address.clone(),
            path: local.to_string_lossy().into_owned(),
            source,
        };

        match fs::remove_dir_all(local) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(io_error(error)),
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        // scp -r creates `local` as a copy of the remote directory
        self.scp(&self.remote(remote), &local.to_string_lossy(), true)
    }

    fn remove_all(&self, path: &str) -> Result<(), HostError> {
        self.ssh_checked(&format!("rm -rf {}", shell_quote(path)))
            .map(|_| ())
    }
}
