//! Linked-clone orchestration with a compensating destroy on failure.

use camino::Utf8PathBuf;
use color_eyre::eyre::Result;
use color_eyre::Report;

use crate::ovf;
use crate::vboxmanage::{DriverError, VBoxManage};

/// Sink for user-facing narration and clone progress.
///
/// Injected by the caller rather than constructed ambiently, so tests can
/// record what would have been shown.
pub trait Reporter {
    fn info(&mut self, message: &str);
    fn progress(&mut self, percent: u8);
    fn clear_progress(&mut self);
}

#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// Name or UUID of the master machine to clone from.
    pub master_id: String,
    /// Name for the new machine.
    pub name: String,
    /// Snapshot of the master the linked clone shares its base disk with.
    pub snapshot: String,
    /// Optional OVF descriptor naming extra disks to attach to the clone.
    pub ovf: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub machine_id: String,
    pub attached_disks: usize,
}

/// The create-clone action: clone, attach, and on unexpected failure tear
/// the half-created machine back down.
#[derive(Debug, Clone)]
pub struct CloneAction {
    pub destroy_on_error: bool,
}

impl CloneAction {
    pub fn run(
        &self,
        driver: &VBoxManage,
        request: &CloneRequest,
        ui: &mut dyn Reporter,
    ) -> Result<CloneOutcome> {
        match self.execute(driver, request, ui) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                if let Err(recover_error) = self.recover(driver, &request.name, &error, ui) {
                    tracing::warn!("cleanup after failed clone also failed: {recover_error:#}");
                }
                Err(error)
            }
        }
    }

    fn execute(
        &self,
        driver: &VBoxManage,
        request: &CloneRequest,
        ui: &mut dyn Reporter,
    ) -> Result<CloneOutcome> {
        tracing::info!(
            "creating linked clone '{}' from master '{}'",
            request.name,
            request.master_id
        );
        ui.info(&format!("Creating linked clone '{}'...", request.name));

        let machine_id = driver.clonevm(&request.master_id, &request.name, &request.snapshot, |p| {
            ui.progress(p)
        })?;
        ui.clear_progress();

        let machine_id =
            machine_id.ok_or_else(|| DriverError::CloneFailure(request.name.clone()))?;

        let mut attached_disks = 0;
        if let Some(path) = &request.ovf {
            let descriptor = ovf::parse_ovf(path)?;
            ui.info(&format!(
                "Attaching {} virtual disk(s) from {}",
                descriptor.disks.len(),
                descriptor.path
            ));
            driver.attach_virtual_disks(&machine_id, &descriptor.disks)?;
            attached_disks = descriptor.disks.len();
        }

        Ok(CloneOutcome {
            machine_id,
            attached_disks,
        })
    }

    /// Compensate for a failed clone by destroying the machine.
    ///
    /// Skipped when the failure is a typed domain error (the caller decides
    /// what those mean), when the caller opted out of cleanup, or when the
    /// machine never came into existence. Destroy is idempotent, so running
    /// recovery twice is safe.
    pub fn recover(
        &self,
        driver: &VBoxManage,
        machine: &str,
        error: &Report,
        ui: &mut dyn Reporter,
    ) -> Result<()> {
        if error.downcast_ref::<DriverError>().is_some() {
            return Ok(());
        }
        if !self.destroy_on_error {
            return Ok(());
        }
        let Some(state) = driver.vm_state(machine)? else {
            return Ok(());
        };
        tracing::warn!("destroying partially created machine '{machine}' (state: {state})");
        ui.info(&format!(
            "Removing partially created machine '{machine}'..."
        ));
        driver.destroy(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[derive(Debug, Default)]
    struct RecordingReporter {
        infos: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn info(&mut self, message: &str) {
            self.infos.push(message.to_string());
        }
        fn progress(&mut self, _: u8) {}
        fn clear_progress(&mut self) {}
    }

    #[test]
    fn recover_skips_typed_domain_errors() {
        let action = CloneAction {
            destroy_on_error: true,
        };
        let mut ui = RecordingReporter::default();
        let error = Report::new(DriverError::CloneFailure("clone-1".to_string()));
        // Domain errors short-circuit before the driver is consulted, so a
        // driver with no VirtualBox behind it must not be touched.
        action
            .recover(&VBoxManage::new(), "clone-1", &error, &mut ui)
            .unwrap();
        assert!(ui.infos.is_empty());
    }

    #[test]
    fn recover_skips_when_cleanup_is_disabled() {
        let action = CloneAction {
            destroy_on_error: false,
        };
        let mut ui = RecordingReporter::default();
        action
            .recover(&VBoxManage::new(), "clone-1", &eyre!("interrupted"), &mut ui)
            .unwrap();
        assert!(ui.infos.is_empty());
    }

    #[test]
    fn import_failure_is_recognized_as_domain_error() {
        let error: Report = DriverError::ImportFailure {
            path: "/path/box.ovf".into(),
            reason: "document has no root element".to_string(),
        }
        .into();
        assert!(error.downcast_ref::<DriverError>().is_some());
    }
}
