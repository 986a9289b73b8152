//! VBoxManage driver: spawns VirtualBox's management CLI and turns its text
//! output into typed records.
//!
//! Every operation is one blocking subprocess invocation. Read-only queries
//! may be retried per policy; state-mutating operations (clone, attach,
//! destroy) never are, so we cannot race VirtualBox's own machine locking.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use color_eyre::eyre::{eyre, Context, Result};
use serde::Serialize;

use crate::command_run::{apply_options, read_back, Captured, CommandRun, ExecOptions};
use crate::guestprop;
use crate::hostnet::{self, DhcpServer, HostOnlyInterface};
use crate::output::parse_blocks;
use crate::ovf::DiskAttachmentSpec;

/// Typed failures the driver distinguishes from generic command errors.
///
/// Absence ("no such machine", "property not set") is not in this list; it
/// is modeled as `Ok(None)` so callers must handle it.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("could not parse OVF descriptor {path}: {reason}")]
    ImportFailure {
        path: camino::Utf8PathBuf,
        reason: String,
    },
    #[error("clone produced no registered machine named '{0}'")]
    CloneFailure(String),
}

/// One `"<name>" {<uuid>}` line from `VBoxManage list vms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineIdentity {
    pub name: String,
    pub id: String,
}

/// Machine state as reported by `showvminfo --machinereadable`.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum MachineState {
    #[strum(serialize = "running")]
    Running,
    #[strum(serialize = "starting")]
    Starting,
    #[strum(serialize = "poweroff")]
    PowerOff,
    #[strum(serialize = "paused")]
    Paused,
    #[strum(serialize = "saved")]
    Saved,
    #[strum(serialize = "aborted")]
    Aborted,
    #[strum(default)]
    Other(String),
}

/// One registered hard disk from `VBoxManage list -l hdds`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HddInfo {
    pub uuid: String,
    pub location: String,
    pub disk_type: Option<String>,
    pub parent_uuid: Option<String>,
}

/// Driver handle for one VBoxManage installation.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    executable: String,
    opts: ExecOptions,
    query_retries: u32,
}

impl Default for VBoxManage {
    fn default() -> Self {
        Self::new()
    }
}

impl VBoxManage {
    pub fn new() -> Self {
        Self {
            executable: "VBoxManage".to_string(),
            opts: ExecOptions::default(),
            query_retries: 0,
        }
    }

    /// Sets the path to the VBoxManage executable.
    pub fn executable<T: Into<String>>(mut self, path: T) -> Self {
        self.executable = path.into().trim().to_string();
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.opts.timeout = timeout;
        self
    }

    /// Additional attempts for read-only queries that fail transiently.
    pub fn query_retries(mut self, retries: u32) -> Self {
        self.query_retries = retries;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.executable)
    }

    /// Run a read-only query and return its stdout, retrying per policy.
    fn query(&self, args: &[&str]) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.command().args(args).run_get_string(&self.opts) {
                Ok(stdout) => return Ok(stdout),
                Err(err) if attempt <= self.query_retries => {
                    tracing::debug!(
                        "VBoxManage {} failed on attempt {attempt}, retrying: {err}",
                        args.join(" ")
                    );
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("VBoxManage {}", args.join(" ")))
                }
            }
        }
    }

    /// Run a state-mutating command. Never retried.
    fn control(&self, args: &[&str]) -> Result<()> {
        self.command()
            .args(args)
            .run_with(&self.opts)
            .with_context(|| format!("VBoxManage {}", args.join(" ")))
    }

    pub fn version(&self) -> Result<String> {
        Ok(self.query(&["--version"])?.trim().to_string())
    }

    pub fn list_vms(&self) -> Result<Vec<MachineIdentity>> {
        Ok(parse_machine_list(&self.query(&["list", "vms"])?))
    }

    /// UUID of the registered machine whose name is exactly `name`.
    pub fn get_machine_id(&self, name: &str) -> Result<Option<String>> {
        Ok(find_machine_id(&self.query(&["list", "vms"])?, name))
    }

    pub fn read_dhcp_servers(&self) -> Result<Vec<DhcpServer>> {
        Ok(hostnet::parse_dhcp_servers(&self.query(&["list", "dhcpservers"])?))
    }

    pub fn read_host_only_interfaces(&self) -> Result<Vec<HostOnlyInterface>> {
        Ok(hostnet::parse_host_only_interfaces(&self.query(&["list", "hostonlyifs"])?))
    }

    pub fn remove_dhcp_server(&self, network_name: &str) -> Result<()> {
        self.control(&["dhcpserver", "remove", "--netname", network_name])
    }

    /// Read one guest property; `Ok(None)` when the property is not set.
    pub fn read_guest_property(&self, machine: &str, key: &str) -> Result<Option<String>> {
        Ok(guestprop::parse_guest_property(&self.query(&[
            "guestproperty",
            "get",
            machine,
            key,
        ])?))
    }

    /// Read the guest's IPv4 address on the given adapter; `Ok(None)` when
    /// unset or still the `0.0.0.0` placeholder.
    pub fn read_guest_ip(&self, machine: &str, adapter: u8) -> Result<Option<String>> {
        let key = format!("/VirtualBox/GuestInfo/Net/{adapter}/V4/IP");
        Ok(guestprop::parse_guest_ip(&self.query(&[
            "guestproperty",
            "get",
            machine,
            &key,
        ])?))
    }

    pub fn list_hdds(&self) -> Result<Vec<HddInfo>> {
        Ok(parse_hdd_list(&self.query(&["list", "-l", "hdds"])?))
    }

    /// Attach each disk to the machine at the controller, port, and device
    /// its attachment spec names.
    ///
    /// A medium VirtualBox does not already know about is attached as
    /// multiattach, so further clones can share the same base disk; a medium
    /// already registered keeps whatever type it was registered with.
    pub fn attach_virtual_disks(&self, machine: &str, disks: &[DiskAttachmentSpec]) -> Result<()> {
        let registered = self.list_hdds()?;
        for disk in disks {
            let args = attach_args(machine, disk, &registered);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.control(&args)?;
        }
        Ok(())
    }

    /// Create a registered linked clone of `master_id` from the named
    /// snapshot, streaming percent ticks to `progress` while VBoxManage
    /// works. Returns the new machine's UUID, or `None` when the clone
    /// command succeeded but no machine with that name ended up registered.
    pub fn clonevm(
        &self,
        master_id: &str,
        name: &str,
        snapshot: &str,
        mut progress: impl FnMut(u8),
    ) -> Result<Option<String>> {
        let mut cmd = self.command();
        cmd.args([
            "clonevm", master_id, "--snapshot", snapshot, "--options", "link", "--name", name,
            "--register",
        ]);
        apply_options(&mut cmd, &self.opts);
        let mut err_file = tempfile::tempfile()?;
        cmd.stderr(err_file.try_clone()?);
        cmd.stdout(Stdio::piped());
        tracing::debug!("cloning '{master_id}' into '{name}' from snapshot '{snapshot}'");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.executable))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("child stdout was not captured"))?;

        let mut scanner = ProgressScanner::default();
        let mut buf = [0u8; 256];
        loop {
            let n = stdout.read(&mut buf).context("read clone progress")?;
            if n == 0 {
                break;
            }
            scanner.feed(&String::from_utf8_lossy(&buf[..n]), &mut progress);
        }

        let status = child.wait()?;
        Captured {
            status,
            stdout: String::new(),
            stderr: read_back(&mut err_file)?,
        }
        .check()
        .context("VBoxManage clonevm")?;

        self.get_machine_id(name)
    }

    /// State of a registered machine; `Ok(None)` when it is not registered
    /// at all ("not created").
    pub fn vm_state(&self, machine: &str) -> Result<Option<MachineState>> {
        let captured = self
            .command()
            .args(["showvminfo", machine, "--machinereadable"])
            .run_capture(&self.opts)?;
        if !captured.success() {
            if is_not_registered(&captured.stderr) {
                return Ok(None);
            }
            captured.check().context("VBoxManage showvminfo")?;
        }
        Ok(parse_vm_state(&captured.stdout))
    }

    /// Unregister the machine and delete its files. Idempotent: destroying
    /// a machine that is not registered succeeds.
    pub fn destroy(&self, machine: &str) -> Result<()> {
        let captured = self
            .command()
            .args(["unregistervm", machine, "--delete"])
            .run_capture(&self.opts)?;
        if captured.success() {
            return Ok(());
        }
        if is_not_registered(&captured.stderr) {
            tracing::debug!("machine '{machine}' is already gone");
            return Ok(());
        }
        captured.check().context("VBoxManage unregistervm")
    }
}

fn is_not_registered(stderr: &str) -> bool {
    stderr.contains("Could not find a registered machine")
}

fn parse_machine_list(text: &str) -> Vec<MachineIdentity> {
    text.lines().filter_map(parse_machine_line).collect()
}

fn parse_machine_line(line: &str) -> Option<MachineIdentity> {
    let rest = line.trim().strip_prefix('"')?;
    let (name, rest) = rest.rsplit_once("\" {")?;
    let id = rest.strip_suffix('}')?;
    Some(MachineIdentity {
        name: name.to_string(),
        id: id.to_string(),
    })
}

fn find_machine_id(text: &str, name: &str) -> Option<String> {
    parse_machine_list(text)
        .into_iter()
        .find(|machine| machine.name == name)
        .map(|machine| machine.id)
}

fn parse_vm_state(text: &str) -> Option<MachineState> {
    let raw = text
        .lines()
        .find_map(|line| line.strip_prefix("VMState=\""))?
        .strip_suffix('"')?;
    raw.parse().ok()
}

const HDD_KEYS: &[&str] = &["UUID", "Location"];

fn parse_hdd_list(text: &str) -> Vec<HddInfo> {
    parse_blocks(text, HDD_KEYS)
        .iter()
        .filter_map(|block| {
            Some(HddInfo {
                uuid: block.get("UUID")?.to_string(),
                location: block.get("Location")?.to_string(),
                disk_type: block.get("Type").map(str::to_string),
                parent_uuid: block.get("Parent UUID").map(str::to_string),
            })
        })
        .collect()
}

fn attach_args(machine: &str, disk: &DiskAttachmentSpec, registered: &[HddInfo]) -> Vec<String> {
    let mut args: Vec<String> = [
        "storageattach",
        machine,
        "--storagectl",
        &disk.controller,
        "--port",
        &disk.port,
        "--device",
        &disk.device,
        "--type",
        "hdd",
        "--medium",
        &disk.file,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let already_registered = registered.iter().any(|hdd| hdd.location == disk.file);
    if !already_registered {
        args.push("--mtype".to_string());
        args.push("multiattach".to_string());
    }
    args
}

/// Incremental scanner for the `0%...10%...100%` ticker VBoxManage prints
/// during long operations. Chunk boundaries may split a tick, so pending
/// digits carry over between feeds.
#[derive(Debug, Default)]
struct ProgressScanner {
    digits: String,
}

impl ProgressScanner {
    fn feed(&mut self, chunk: &str, emit: &mut impl FnMut(u8)) {
        for ch in chunk.chars() {
            if ch.is_ascii_digit() {
                if self.digits.len() < 3 {
                    self.digits.push(ch);
                } else {
                    self.digits.clear();
                }
            } else if ch == '%' && !self.digits.is_empty() {
                if let Ok(percent) = self.digits.parse::<u8>() {
                    if percent <= 100 {
                        emit(percent);
                    }
                }
                self.digits.clear();
            } else {
                self.digits.clear();
            }
        }
    }
}
