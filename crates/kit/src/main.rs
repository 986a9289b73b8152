//! vboxkit - drive VirtualBox VMs through the VBoxManage CLI

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

mod clone;
mod command_run;
mod guestprop;
mod hostnet;
mod output;
mod ovf;
mod utils;
mod vboxmanage;

use clone::{CloneAction, CloneRequest, Reporter};
use vboxmanage::VBoxManage;

/// A toolkit for VirtualBox machines: linked clones, disk attachment, and
/// structured queries over VBoxManage's listing output.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to the VBoxManage executable
    #[clap(long, default_value = "VBoxManage", global = true)]
    vboxmanage: String,

    /// Timeout in seconds applied to each VBoxManage invocation
    #[clap(long, global = true)]
    timeout: Option<u64>,

    /// Extra attempts for read-only queries that fail transiently
    #[clap(long, default_value = "0", global = true)]
    query_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List machines, DHCP servers, host-only interfaces, or hard disks
    #[clap(subcommand)]
    List(ListCommands),

    /// Read properties exposed by a running guest
    #[clap(subcommand)]
    Guest(GuestCommands),

    /// Create a linked clone from a master machine
    Clone(CloneOpts),

    /// Unregister a machine and delete its files
    Destroy {
        /// Machine name or UUID
        machine: String,
    },

    /// Remove a DHCP server by its network name
    RemoveDhcpServer {
        /// Network name, e.g. HostInterfaceNetworking-vboxnet0
        netname: String,
    },

    /// Show the VirtualBox version VBoxManage reports
    Version,
}

#[derive(Subcommand)]
enum ListCommands {
    /// Registered machines
    Vms {
        /// Output as structured JSON instead of a table
        #[clap(long)]
        json: bool,
    },
    /// DHCP servers on host networks
    DhcpServers {
        #[clap(long)]
        json: bool,
    },
    /// Host-only network interfaces
    HostOnlyIfs {
        #[clap(long)]
        json: bool,
    },
    /// Registered hard disk media
    Hdds {
        #[clap(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GuestCommands {
    /// Read a single guest property by key
    Property {
        /// Machine name or UUID
        machine: String,
        /// Property key, e.g. /VirtualBox/GuestInfo/OS/Product
        key: String,
    },
    /// Read the guest's IPv4 address on an adapter
    Ip {
        /// Machine name or UUID
        machine: String,
        /// Guest network adapter number
        #[clap(long, default_value = "1")]
        adapter: u8,
    },
}

#[derive(Parser)]
struct CloneOpts {
    /// Name or UUID of the master machine to clone from
    master: String,

    /// Name for the new machine (auto-generated if not specified)
    #[clap(long)]
    name: Option<String>,

    /// Snapshot of the master the linked clone is based on
    #[clap(long, default_value = "base")]
    snapshot: String,

    /// OVF descriptor naming extra disks to attach to the clone
    #[clap(long)]
    ovf: Option<Utf8PathBuf>,

    /// Keep the half-created machine around if the clone fails
    #[clap(long)]
    keep_on_error: bool,
}

/// Install and configure the tracing/logging system.
///
/// Structured logging with environment-based filtering, error layer
/// integration, and console output formatting. Filtered by the RUST_LOG
/// environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Reporter that narrates to stdout and renders clone progress as an
/// indicatif bar.
#[derive(Default)]
struct ConsoleReporter {
    bar: Option<ProgressBar>,
}

impl Reporter for ConsoleReporter {
    fn info(&mut self, message: &str) {
        println!("{message}");
    }

    fn progress(&mut self, percent: u8) {
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(100);
            let style = ProgressStyle::with_template("{bar:40} {pos}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        });
        bar.set_position(u64::from(percent));
    }

    fn clear_progress(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn print_listing<T: Serialize>(items: &[T], json: bool, header: &[&str], row: impl Fn(&T) -> Vec<String>) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(items)?);
        return Ok(());
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(header.to_vec());
    for item in items {
        table.add_row(row(item));
    }
    println!("{table}");
    Ok(())
}

fn main() -> Result<()> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    let driver = VBoxManage::new()
        .executable(cli.vboxmanage)
        .timeout(cli.timeout.map(Duration::from_secs))
        .query_retries(cli.query_retries);

    match cli.command {
        Commands::List(ListCommands::Vms { json }) => {
            let machines = driver.list_vms()?;
            print_listing(&machines, json, &["NAME", "UUID"], |m| {
                vec![m.name.clone(), m.id.clone()]
            })?;
        }
        Commands::List(ListCommands::DhcpServers { json }) => {
            let servers = driver.read_dhcp_servers()?;
            print_listing(
                &servers,
                json,
                &["NETWORK NAME", "NETWORK", "IP", "NETMASK", "LOWER", "UPPER"],
                |s| {
                    vec![
                        s.network_name.clone(),
                        s.network.clone(),
                        s.ip.clone(),
                        s.netmask.clone(),
                        s.lower.clone(),
                        s.upper.clone(),
                    ]
                },
            )?;
        }
        Commands::List(ListCommands::HostOnlyIfs { json }) => {
            let interfaces = driver.read_host_only_interfaces()?;
            print_listing(&interfaces, json, &["NAME", "IP", "NETMASK", "STATUS"], |i| {
                vec![i.name.clone(), i.ip.clone(), i.netmask.clone(), i.status.clone()]
            })?;
        }
        Commands::List(ListCommands::Hdds { json }) => {
            let hdds = driver.list_hdds()?;
            print_listing(&hdds, json, &["UUID", "PARENT", "TYPE", "LOCATION"], |h| {
                vec![
                    h.uuid.clone(),
                    h.parent_uuid.clone().unwrap_or_default(),
                    h.disk_type.clone().unwrap_or_default(),
                    h.location.clone(),
                ]
            })?;
        }
        Commands::Guest(GuestCommands::Property { machine, key }) => {
            match driver.read_guest_property(&machine, &key)? {
                Some(value) => println!("{value}"),
                None => return Err(eyre!("guest property '{key}' is not set on '{machine}'")),
            }
        }
        Commands::Guest(GuestCommands::Ip { machine, adapter }) => {
            match driver.read_guest_ip(&machine, adapter)? {
                Some(ip) => println!("{ip}"),
                None => {
                    return Err(eyre!(
                        "guest '{machine}' has no usable IPv4 address on adapter {adapter}"
                    ))
                }
            }
        }
        Commands::Clone(opts) => {
            let name = match opts.name {
                Some(name) => name,
                None => {
                    let existing: Vec<String> =
                        driver.list_vms()?.into_iter().map(|m| m.name).collect();
                    utils::generate_unique_vm_name(&format!("{}-clone", opts.master), &existing)
                }
            };
            let request = CloneRequest {
                master_id: opts.master,
                name,
                snapshot: opts.snapshot,
                ovf: opts.ovf,
            };
            let action = CloneAction {
                destroy_on_error: !opts.keep_on_error,
            };
            let mut ui = ConsoleReporter::default();
            let outcome = action.run(&driver, &request, &mut ui)?;
            println!("Created machine {} ({})", request.name, outcome.machine_id);
            if outcome.attached_disks > 0 {
                println!("Attached {} virtual disk(s)", outcome.attached_disks);
            }
        }
        Commands::Destroy { machine } => {
            driver.destroy(&machine)?;
            println!("Destroyed '{machine}'");
        }
        Commands::RemoveDhcpServer { netname } => {
            driver.remove_dhcp_server(&netname)?;
            println!("Removed DHCP server for '{netname}'");
        }
        Commands::Version => {
            println!("{}", driver.version()?);
        }
    }

    Ok(())
}
