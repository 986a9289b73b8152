//! Integration tests for vboxkit
//!
//! These drive the built binary against a real VirtualBox installation and
//! skip cleanly when VBoxManage is not available.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context, Result};
use libtest_mimic::{Arguments, Trial};
use serde_json::Value;
use xshell::{cmd, Shell};

/// Get the path to the vboxkit binary, checking VBOXKIT_PATH first, then
/// falling back to "vboxkit".
fn vboxkit_command() -> Result<String> {
    if let Ok(path) = std::env::var("VBOXKIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/vboxkit", "target/release/vboxkit"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set VBOXKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("vboxkit".to_owned())
}

fn have_virtualbox() -> bool {
    std::process::Command::new("VBoxManage")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Every `list` subcommand must produce a JSON array under `--json`, even
/// when the host has nothing to list.
fn test_list_json_output() -> Result<()> {
    let sh = Shell::new()?;
    let bin = vboxkit_command()?;

    for listing in ["vms", "dhcp-servers", "host-only-ifs", "hdds"] {
        let output = cmd!(sh, "{bin} list {listing} --json").read()?;
        let parsed: Value = serde_json::from_str(&output)
            .with_context(|| format!("'list {listing} --json' did not produce JSON"))?;
        parsed
            .as_array()
            .ok_or_else(|| eyre!("expected a JSON array from 'list {listing}', got: {output}"))?;
    }
    Ok(())
}

/// Destroy is idempotent: removing a machine that was never registered is a
/// success, not an error.
fn test_destroy_unknown_machine_succeeds() -> Result<()> {
    let sh = Shell::new()?;
    let bin = vboxkit_command()?;

    let name = "vboxkit-test-never-created-7f3a";
    cmd!(sh, "{bin} destroy {name}")
        .run()
        .context("destroy of an unregistered machine should succeed")?;
    // Run it again; the second pass must also be a no-op success.
    cmd!(sh, "{bin} destroy {name}").run()?;
    Ok(())
}

/// Reading a guest property from an unknown machine is a hard failure.
fn test_guest_property_unknown_machine_fails() -> Result<()> {
    let sh = Shell::new()?;
    let bin = vboxkit_command()?;

    let name = "vboxkit-test-never-created-7f3a";
    let result = cmd!(sh, "{bin} guest property {name} /VirtualBox/GuestInfo/OS/Product")
        .quiet()
        .ignore_status()
        .output()?;
    if result.status.success() {
        return Err(eyre!("guest property read on an unknown machine succeeded"));
    }
    Ok(())
}

fn main() {
    if !have_virtualbox() {
        eprintln!("VBoxManage not found on PATH; skipping all integration tests.");
        std::process::exit(0);
    }

    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("list_json_output", || {
            test_list_json_output().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("destroy_unknown_machine_succeeds", || {
            test_destroy_unknown_machine_succeeds().map_err(|e| format!("{e:?}").into())
        }),
        Trial::test("guest_property_unknown_machine_fails", || {
            test_guest_property_unknown_machine_fails().map_err(|e| format!("{e:?}").into())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
