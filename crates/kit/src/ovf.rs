//! OVF descriptor parsing: extracting virtual-disk attachment specs.
//!
//! A VirtualBox-exported OVF names each disk image three times: the
//! `References` section maps file ids to paths, the `DiskSection` maps disk
//! uuids to file references, and the machine section's storage controllers
//! attach images by uuid. Extracting attachment specs means joining those
//! three sections on the disk-reference identifiers. Controller name, port,
//! and device are taken verbatim from the descriptor; nothing is defaulted.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::vboxmanage::DriverError;

/// One disk-to-controller attachment extracted from an OVF descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskAttachmentSpec {
    pub controller: String,
    pub port: String,
    pub device: String,
    /// Backing file path, resolved against the descriptor's directory.
    pub file: String,
}

/// A parsed descriptor: the attachment specs plus the path they came from.
#[derive(Debug, Clone)]
pub struct OvfDescriptor {
    pub path: Utf8PathBuf,
    pub disks: Vec<DiskAttachmentSpec>,
}

/// Load and parse an OVF descriptor.
///
/// Fails with [`DriverError::ImportFailure`] when the document is empty or
/// malformed.
pub fn parse_ovf(path: &Utf8Path) -> Result<OvfDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read OVF descriptor {path}"))?;
    let disks = parse_ovf_str(&content, path).map_err(|reason| DriverError::ImportFailure {
        path: path.to_owned(),
        reason,
    })?;
    Ok(OvfDescriptor {
        path: path.to_owned(),
        disks,
    })
}

fn parse_ovf_str(xml: &str, ovf_path: &Utf8Path) -> Result<Vec<DiskAttachmentSpec>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // References section: file id -> href.
    let mut file_hrefs: Vec<(String, String)> = Vec::new();
    // DiskSection: disk uuid -> file reference.
    let mut disk_refs: Vec<(String, String)> = Vec::new();
    // Machine section, in document order: (controller, port, device, uuid).
    let mut attachments: Vec<(String, String, String, String)> = Vec::new();

    let mut saw_root = false;
    let mut controller: Option<String> = None;
    let mut device_addr: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                saw_root = true;
                match e.local_name().as_ref() {
                    b"StorageController" => controller = attr(e, "name"),
                    b"AttachedDevice" => {
                        device_addr = match (attr(e, "type").as_deref(), attr(e, "port"), attr(e, "device")) {
                            (Some("HardDisk"), Some(port), Some(device)) => Some((port, device)),
                            _ => None,
                        };
                    }
                    _ => collect_leaf(e, &mut file_hrefs, &mut disk_refs, &mut attachments, &controller, &device_addr),
                }
            }
            Ok(Event::Empty(ref e)) => {
                saw_root = true;
                collect_leaf(e, &mut file_hrefs, &mut disk_refs, &mut attachments, &controller, &device_addr);
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"StorageController" => controller = None,
                b"AttachedDevice" => device_addr = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }

    if !saw_root {
        return Err("document has no root element".to_string());
    }

    let base = ovf_path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut specs = Vec::new();
    for (controller, port, device, uuid) in attachments {
        let Some((_, file_ref)) = disk_refs.iter().find(|(disk_uuid, _)| *disk_uuid == uuid) else {
            tracing::debug!("no disk definition for attached image {uuid}");
            continue;
        };
        let Some((_, href)) = file_hrefs.iter().find(|(id, _)| id == file_ref) else {
            tracing::debug!("no file reference '{file_ref}' for attached image {uuid}");
            continue;
        };
        specs.push(DiskAttachmentSpec {
            controller,
            port,
            device,
            file: base.join(href).into_string(),
        });
    }
    Ok(specs)
}

fn collect_leaf(
    e: &BytesStart<'_>,
    file_hrefs: &mut Vec<(String, String)>,
    disk_refs: &mut Vec<(String, String)>,
    attachments: &mut Vec<(String, String, String, String)>,
    controller: &Option<String>,
    device_addr: &Option<(String, String)>,
) {
    match e.local_name().as_ref() {
        b"File" => {
            if let (Some(id), Some(href)) = (attr(e, "id"), attr(e, "href")) {
                file_hrefs.push((id, href));
            }
        }
        b"Disk" => {
            if let (Some(uuid), Some(file_ref)) = (attr(e, "uuid"), attr(e, "fileRef")) {
                disk_refs.push((normalize_uuid(&uuid).to_string(), file_ref));
            }
        }
        b"Image" => {
            if let (Some(controller), Some((port, device)), Some(uuid)) =
                (controller, device_addr, attr(e, "uuid"))
            {
                attachments.push((
                    controller.clone(),
                    port.clone(),
                    device.clone(),
                    normalize_uuid(&uuid).to_string(),
                ));
            }
        }
        _ => {}
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

fn normalize_uuid(raw: &str) -> &str {
    raw.trim_matches(|c| c == '{' || c == '}')
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_DISK_OVF: &str = r#"<?xml version="1.0"?>
<Envelope ovf:version="1.0" xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:vbox="http://www.virtualbox.org/ovf/machine">
  <References>
    <File ovf:href="box-disk1.vmdk" ovf:id="file1"/>
  </References>
  <DiskSection>
    <Info>List of the virtual disks used in the package</Info>
    <Disk ovf:capacity="85899345920" ovf:diskId="vmdisk1" ovf:fileRef="file1" vbox:uuid="e1246c7c-05dd-48c5-aa5b-5ad44ce0c13e"/>
  </DiskSection>
  <VirtualSystem ovf:id="ubuntu64-base">
    <vbox:Machine>
      <StorageControllers>
        <StorageController name="IDE Controller" type="PIIX4" PortCount="2"/>
        <StorageController name="SATA Controller" type="AHCI" PortCount="1">
          <AttachedDevice type="HardDisk" port="0" device="0">
            <Image uuid="{e1246c7c-05dd-48c5-aa5b-5ad44ce0c13e}"/>
          </AttachedDevice>
        </StorageController>
      </StorageControllers>
    </vbox:Machine>
  </VirtualSystem>
</Envelope>
"#;

    #[test]
    fn single_disk_descriptor_yields_one_spec() {
        let disks = parse_ovf_str(SINGLE_DISK_OVF, Utf8Path::new("/path/box.ovf")).unwrap();
        assert_eq!(
            disks,
            vec![DiskAttachmentSpec {
                controller: "SATA Controller".to_string(),
                port: "0".to_string(),
                device: "0".to_string(),
                file: "/path/box-disk1.vmdk".to_string(),
            }]
        );
    }

    #[test]
    fn empty_document_is_an_import_failure() {
        assert!(parse_ovf_str("", Utf8Path::new("/path/box.ovf")).is_err());
        assert!(parse_ovf_str("   \n", Utf8Path::new("/path/box.ovf")).is_err());
    }

    #[test]
    fn empty_file_raises_import_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box.ovf");
        std::fs::write(&path, "").unwrap();
        let path = Utf8PathBuf::from_path_buf(path).unwrap();
        let err = parse_ovf(&path).unwrap_err();
        assert!(err.downcast_ref::<DriverError>().is_some());
    }

    #[test]
    fn attachment_without_disk_definition_is_skipped() {
        let xml = r#"<Envelope>
  <vbox:Machine xmlns:vbox="http://www.virtualbox.org/ovf/machine">
    <StorageControllers>
      <StorageController name="SATA Controller">
        <AttachedDevice type="HardDisk" port="0" device="0">
          <Image uuid="{00000000-0000-0000-0000-000000000000}"/>
        </AttachedDevice>
      </StorageController>
    </StorageControllers>
  </vbox:Machine>
</Envelope>"#;
        let disks = parse_ovf_str(xml, Utf8Path::new("/path/box.ovf")).unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn dvd_attachments_are_not_disk_specs() {
        let xml = r#"<Envelope>
  <References>
    <File ovf:href="box-disk1.vmdk" ovf:id="file1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"/>
  </References>
  <DiskSection>
    <Disk ovf:diskId="vmdisk1" ovf:fileRef="file1" vbox:uuid="aaaa" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:vbox="http://www.virtualbox.org/ovf/machine"/>
  </DiskSection>
  <StorageControllers>
    <StorageController name="IDE Controller">
      <AttachedDevice type="DVD" port="1" device="0">
        <Image uuid="{aaaa}"/>
      </AttachedDevice>
    </StorageController>
  </StorageControllers>
</Envelope>"#;
        let disks = parse_ovf_str(xml, Utf8Path::new("/path/box.ovf")).unwrap();
        assert!(disks.is_empty());
    }

    #[test]
    fn reparsing_yields_equal_specs() {
        let a = parse_ovf_str(SINGLE_DISK_OVF, Utf8Path::new("/p/box.ovf")).unwrap();
        let b = parse_ovf_str(SINGLE_DISK_OVF, Utf8Path::new("/p/box.ovf")).unwrap();
        assert_eq!(a, b);
    }
}
