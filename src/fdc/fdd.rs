//! Floppy disk drive model.
//!
//! Models the physical drive: spindle motor, head position, the
//! inserted disk and its write-protect tab. The drive owns the disk
//! image while it is inserted; the index pulse itself is derived from
//! the shared clock by the controller, which also owns motor timeout
//! policy.

use log::info;

use super::disk_image::DiskImage;
use super::MAX_PHYSICAL_CYLINDER;
use crate::message_center::{MessageCenter, Notification};

/// Typical motor spin-down timeout.
pub const MOTOR_STOP_TIMEOUT_MS: u32 = 200;

/// Typical head engage time.
pub const HEAD_LOAD_TIME_MS: u32 = 50;

pub struct Fdd {
    drive_id: u8,
    emulator_id: String,
    motor_on: bool,
    track: u8,
    side: bool,
    disk: Option<DiskImage>,
    write_protect: bool,
    pub motor_stop_timeout_ms: u32,
    message_center: MessageCenter,
}

impl Fdd {
    pub fn new(drive_id: u8, emulator_id: &str, message_center: MessageCenter) -> Self {
        Self {
            drive_id,
            emulator_id: emulator_id.to_string(),
            motor_on: false,
            track: 0,
            side: false,
            disk: None,
            write_protect: false,
            motor_stop_timeout_ms: MOTOR_STOP_TIMEOUT_MS,
            message_center,
        }
    }

    pub fn drive_id(&self) -> u8 {
        self.drive_id
    }

    // ── Motor ──────────────────────────────────────────────────

    pub fn motor(&self) -> bool {
        self.motor_on
    }

    /// Toggle the spindle. Both edges notify subscribers.
    pub fn set_motor(&mut self, on: bool) {
        if self.motor_on == on {
            return;
        }
        self.motor_on = on;

        let event = if on {
            Notification::FddMotorStarted { drive_id: self.drive_id }
        } else {
            Notification::FddMotorStopped { drive_id: self.drive_id }
        };
        self.message_center.post(event);
    }

    // ── Head position ──────────────────────────────────────────

    pub fn track(&self) -> u8 {
        self.track
    }

    pub fn set_track(&mut self, track: u8) {
        self.track = track.min(MAX_PHYSICAL_CYLINDER);
    }

    pub fn is_track00(&self) -> bool {
        self.track == 0
    }

    pub fn side(&self) -> bool {
        self.side
    }

    pub fn set_side(&mut self, top: bool) {
        self.side = top;
    }

    // ── Disk ───────────────────────────────────────────────────

    pub fn is_disk_inserted(&self) -> bool {
        self.disk.is_some()
    }

    /// Drive readiness follows the disk-in-place sensor.
    pub fn is_ready(&self) -> bool {
        self.disk.is_some()
    }

    pub fn is_write_protect(&self) -> bool {
        self.write_protect
    }

    pub fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }

    pub fn disk(&self) -> Option<&DiskImage> {
        self.disk.as_ref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut DiskImage> {
        self.disk.as_mut()
    }

    /// Insert a disk. `None` is a silent no-op; inserting over an
    /// already-loaded disk ejects it first (with its notification).
    pub fn insert_disk(&mut self, disk: Option<DiskImage>) {
        let Some(disk) = disk else {
            return;
        };

        if self.disk.is_some() {
            self.eject_disk();
        }

        let path = if disk.file_path.is_empty() {
            None
        } else {
            Some(disk.file_path.clone())
        };
        info!("drive {}: disk inserted ({:?})", self.drive_id, path);

        self.disk = Some(disk);
        self.message_center.post(Notification::FddDiskInserted {
            emulator_id: self.emulator_id.clone(),
            drive_id: self.drive_id,
            disk_path: path,
        });
    }

    /// Eject the disk, notifying subscribers before the reference is
    /// dropped. Safe no-op when the drive is empty.
    pub fn eject_disk(&mut self) -> Option<DiskImage> {
        let disk = self.disk.take()?;

        let path = if disk.file_path.is_empty() {
            None
        } else {
            Some(disk.file_path.clone())
        };
        info!("drive {}: disk ejected ({:?})", self.drive_id, path);

        self.message_center.post(Notification::FddDiskEjected {
            emulator_id: self.emulator_id.clone(),
            drive_id: self.drive_id,
            disk_path: path,
        });

        Some(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_center::EventId;
    use std::time::Duration;

    fn test_drive() -> (Fdd, MessageCenter) {
        let center = MessageCenter::new();
        (Fdd::new(0, "emu-test", center.clone()), center)
    }

    #[test]
    fn test_motor_notifications() {
        let (mut fdd, center) = test_drive();
        let started = center.subscribe(EventId::FddMotorStarted);
        let stopped = center.subscribe(EventId::FddMotorStopped);

        fdd.set_motor(true);
        fdd.set_motor(true); // no edge, no event
        fdd.set_motor(false);

        assert!(started.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(stopped.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(started.try_recv().is_err());
    }

    #[test]
    fn test_insert_eject_lifecycle() {
        let (mut fdd, center) = test_drive();
        let inserted = center.subscribe(EventId::FddDiskInserted);
        let ejected = center.subscribe(EventId::FddDiskEjected);

        assert!(!fdd.is_disk_inserted());
        assert!(fdd.eject_disk().is_none()); // empty eject is a no-op
        fdd.insert_disk(None); // no-op, no notification

        let mut disk = DiskImage::new(80, 2);
        disk.file_path = "games.trd".into();
        fdd.insert_disk(Some(disk));
        assert!(fdd.is_disk_inserted());
        assert!(fdd.is_ready());

        let event = inserted.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            Notification::FddDiskInserted { drive_id, disk_path, .. } => {
                assert_eq!(drive_id, 0);
                assert_eq!(disk_path.as_deref(), Some("games.trd"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let disk = fdd.eject_disk().expect("disk comes back out");
        assert_eq!(disk.file_path, "games.trd");
        assert!(ejected.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(!fdd.is_ready());
    }

    #[test]
    fn test_track_clamping() {
        let (mut fdd, _center) = test_drive();
        fdd.set_track(200);
        assert_eq!(fdd.track(), MAX_PHYSICAL_CYLINDER);
        fdd.set_track(0);
        assert!(fdd.is_track00());
    }
}
