//! [`TokenTransport`] over Linux hidraw nodes.
//!
//! FIDO devices are found by the usage page in their report descriptor under
//! `/sys/class/hidraw`; the matching `/dev/hidrawN` node is then driven with
//! U2FHID framing.

use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Write as _};
use std::os::fd::AsRawFd as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::hid::{REPORT_LEN, ReportIo, U2fHidDevice};
use crate::tag::DevicePath;
use crate::transport::{DeviceInfo, TokenDevice, TokenTransport, TransportError};

const FIDO_USAGE_PAGE: u32 = 0xf1d0;

/// True when a HID report descriptor declares the FIDO usage page.
pub fn is_fido_descriptor(mut desc: &[u8]) -> bool {
    while let Some((&prefix, rest)) = desc.split_first() {
        if prefix == 0xfe {
            // Long item: size, tag, data.
            let Some(&size) = rest.first() else {
                return false;
            };
            let skip = 2 + usize::from(size);
            if rest.len() < skip {
                return false;
            }
            desc = &rest[skip..];
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            n => usize::from(n),
        };
        if rest.len() < size {
            return false;
        }
        let (data, tail) = rest.split_at(size);
        // Global item, tag 0: Usage Page.
        if prefix & 0xfc == 0x04 {
            let page = data
                .iter()
                .rev()
                .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
            if page == FIDO_USAGE_PAGE {
                return true;
            }
        }
        desc = tail;
    }
    false
}

fn hid_name(uevent: &str) -> Option<String> {
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("HID_NAME="))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Enumerates and opens U2F tokens through hidraw.
#[derive(Debug, Clone)]
pub struct HidrawTransport {
    sysfs: PathBuf,
    dev: PathBuf,
}

impl Default for HidrawTransport {
    fn default() -> Self {
        Self::with_roots("/sys/class/hidraw", "/dev")
    }
}

impl HidrawTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for devices under `sysfs` and open nodes under `dev`.
    pub fn with_roots(sysfs: impl Into<PathBuf>, dev: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            dev: dev.into(),
        }
    }

    fn inspect(&self, entry: &Path, name: &str) -> Option<DeviceInfo> {
        let device = entry.join("device");
        let descriptor = match std::fs::read(device.join("report_descriptor")) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(node = name, error = %e, "no readable report descriptor");
                return None;
            }
        };
        if !is_fido_descriptor(&descriptor) {
            return None;
        }
        let product = std::fs::read_to_string(device.join("uevent"))
            .ok()
            .and_then(|uevent| hid_name(&uevent))
            .unwrap_or_else(|| "U2F token".to_string());
        Some(DeviceInfo {
            path: DevicePath::new(self.dev.join(name).to_string_lossy().into_owned()),
            product,
        })
    }
}

impl TokenTransport for HidrawTransport {
    fn devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let entries = match std::fs::read_dir(&self.sysfs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TransportError::Enumerate(format!(
                    "{}: {e}",
                    self.sysfs.display()
                )));
            }
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(info) = self.inspect(&entry.path(), name) {
                debug!(path = %info.path, product = %info.product, "found U2F token");
                found.push(info);
            }
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    fn open(&self, path: &DevicePath) -> Result<Box<dyn TokenDevice>, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_str())
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TransportError::NotAttached(path.clone()),
                _ => TransportError::Io(e),
            })?;
        let device = U2fHidDevice::init(HidrawNode { file })?;
        Ok(Box::new(device))
    }
}

/// An open `/dev/hidrawN` node.
struct HidrawNode {
    file: File,
}

impl ReportIo for HidrawNode {
    fn write_report(&mut self, report: &[u8; REPORT_LEN]) -> io::Result<()> {
        // Report ID 0 goes first for devices without numbered reports.
        let mut buf = [0u8; REPORT_LEN + 1];
        buf[1..].copy_from_slice(report);
        self.file.write_all(&buf)
    }

    fn read_report(&mut self, timeout: Duration) -> io::Result<[u8; REPORT_LEN]> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: poll reads and writes exactly one initialised pollfd.
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        match ready {
            -1 => return Err(io::Error::last_os_error()),
            0 => return Err(io::ErrorKind::TimedOut.into()),
            _ => {}
        }

        let mut buf = [0u8; REPORT_LEN];
        let n = self.file.read(&mut buf)?;
        if n != REPORT_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short HID report ({n} bytes)"),
            ));
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Start of a typical FIDO report descriptor.
    const FIDO_DESCRIPTOR: &[u8] = &[
        0x06, 0xd0, 0xf1, 0x09, 0x01, 0xa1, 0x01, 0x09, 0x20, 0x15, 0x00, 0x26, 0xff, 0x00,
        0x75, 0x08, 0x95, 0x40, 0x81, 0x02, 0xc0,
    ];
    const KEYBOARD_DESCRIPTOR: &[u8] = &[0x05, 0x01, 0x09, 0x06, 0xa1, 0x01, 0xc0];

    fn fake_node(sysfs: &Path, name: &str, descriptor: Option<&[u8]>, uevent: &str) {
        let device = sysfs.join(name).join("device");
        std::fs::create_dir_all(&device).unwrap();
        if let Some(descriptor) = descriptor {
            std::fs::write(device.join("report_descriptor"), descriptor).unwrap();
        }
        std::fs::write(device.join("uevent"), uevent).unwrap();
    }

    #[test]
    fn descriptor_usage_page_is_detected() {
        assert!(is_fido_descriptor(FIDO_DESCRIPTOR));
        assert!(!is_fido_descriptor(KEYBOARD_DESCRIPTOR));
        assert!(!is_fido_descriptor(&[]));
        // Truncated item.
        assert!(!is_fido_descriptor(&[0x06, 0xd0]));

        let mut with_long_item = vec![0xfe, 0x02, 0x10, 0xaa, 0xbb];
        with_long_item.extend_from_slice(FIDO_DESCRIPTOR);
        assert!(is_fido_descriptor(&with_long_item));
    }

    #[test]
    fn lists_only_fido_nodes_with_their_names() {
        let root = tempfile::tempdir().unwrap();
        let sysfs = root.path().join("sys");
        fake_node(
            &sysfs,
            "hidraw3",
            Some(FIDO_DESCRIPTOR),
            "DRIVER=hid-generic\nHID_NAME=Yubico YubiKey OTP+FIDO+CCID\n",
        );
        fake_node(&sysfs, "hidraw0", Some(KEYBOARD_DESCRIPTOR), "HID_NAME=Keyboard\n");
        fake_node(&sysfs, "hidraw1", None, "HID_NAME=Gone\n");
        fake_node(&sysfs, "hidraw5", Some(FIDO_DESCRIPTOR), "DRIVER=hid-generic\n");

        let transport = HidrawTransport::with_roots(&sysfs, "/dev");
        let devices = transport.devices().unwrap();
        assert_eq!(
            devices,
            vec![
                DeviceInfo {
                    path: DevicePath::new("/dev/hidraw3"),
                    product: "Yubico YubiKey OTP+FIDO+CCID".to_string(),
                },
                DeviceInfo {
                    path: DevicePath::new("/dev/hidraw5"),
                    product: "U2F token".to_string(),
                },
            ]
        );
    }

    #[test]
    fn missing_sysfs_lists_nothing_and_missing_node_is_not_attached() {
        let root = tempfile::tempdir().unwrap();
        let transport =
            HidrawTransport::with_roots(root.path().join("absent"), root.path().join("dev"));
        assert!(transport.devices().unwrap().is_empty());

        let path = DevicePath::new(root.path().join("dev/hidraw9").to_string_lossy().into_owned());
        assert!(matches!(
            transport.open(&path),
            Err(TransportError::NotAttached(ref p)) if p == &path
        ));
    }
}
