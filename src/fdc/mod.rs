//! Beta Disk interface: WD1793 controller, drive model, disk images,
//! the MFM track codec and the TRD loader.

pub mod crc;
pub mod disk_image;
pub mod fdd;
pub mod mfm;
pub mod trd;
pub mod wd1793;

use crate::machine::clock::Z80_FREQUENCY;

// ── Drive geometry and timing ─────────────────────────────────

/// 300 RPM spindle → 5 revolutions per second.
pub const FDD_RPS: u64 = 5;

/// One full revolution in T-states (200 ms).
pub const DISK_ROTATION_PERIOD_TSTATES: u64 = Z80_FREQUENCY / FDD_RPS;

/// Index strobe is active for 2% of the revolution (≈4 ms).
pub const INDEX_STROBE_DURATION_TSTATES: u64 = DISK_ROTATION_PERIOD_TSTATES / 100 * 2;

/// Raw MFM track length: 250 kbps / 8 bits over one 200 ms revolution.
pub const RAW_TRACK_SIZE: usize = 6250;

/// TR-DOS layout: 16 sectors of 256 bytes per track.
pub const SECTORS_PER_TRACK: usize = 16;
pub const SECTOR_SIZE_BYTES: usize = 256;

/// Largest data block the WD1793 addresses (size code 3).
pub const MAX_SECTOR_DATA_LEN: usize = 1024;

/// Images with more cylinders than this are rejected; seeks clamp here.
pub const MAX_CYLINDERS: u8 = 86;
pub const MAX_PHYSICAL_CYLINDER: u8 = 86;
pub const MAX_SIDES: u8 = 2;

/// Host must service DRQ within one byte time: 32 µs at 250 kbps,
/// which is 112 T-states at 3.5 MHz.
pub const TSTATES_PER_FDC_BYTE: u64 = Z80_FREQUENCY / (RAW_TRACK_SIZE as u64 * FDD_RPS);

// ── Address marks ─────────────────────────────────────────────

pub const SYNC_BYTE: u8 = 0xA1;
pub const IDAM: u8 = 0xFE;
pub const DAM: u8 = 0xFB;
pub const DDAM: u8 = 0xF8;
pub const INDEX_AM: u8 = 0xFC;
pub const GAP_BYTE: u8 = 0x4E;
