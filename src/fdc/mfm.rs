//! Raw MFM track parsing and validation.
//!
//! The parser scans one 6250-byte revolution for `A1 A1 A1` sync runs,
//! decodes IDAM/DAM records with CRC checks, and indexes sectors by
//! their advertised number. The validator layers triaged diagnostics
//! on top so a broken Write Track stream can be explained, not just
//! rejected.

use std::fmt;

use super::crc::crc_wd1793;
use super::{DAM, DDAM, GAP_BYTE, IDAM, RAW_TRACK_SIZE, SECTORS_PER_TRACK, SYNC_BYTE};

/// IDAM record size excluding sync bytes: FE C H S N CRC CRC.
const IDAM_SIZE: usize = 7;

/// Result of parsing a single sector.
#[derive(Debug, Clone, Default)]
pub struct SectorParse {
    pub found: bool,
    pub idam_offset: usize,
    pub data_offset: usize,

    pub cylinder: u8,
    pub head: u8,
    pub sector_no: u8,
    pub size_code: u8,

    pub idam_crc_valid: bool,
    pub idam_crc_expected: u16,
    pub idam_crc_calculated: u16,

    pub data_block_found: bool,
    pub deleted_data: bool,
    pub data_crc_valid: bool,
    pub data_crc_expected: u16,
    pub data_crc_calculated: u16,

    pub error: String,
}

impl SectorParse {
    pub fn sector_size(&self) -> usize {
        128 << (self.size_code & 0x03)
    }

    pub fn is_valid(&self) -> bool {
        self.found && self.idam_crc_valid && self.data_block_found && self.data_crc_valid
    }

    pub fn status(&self) -> &'static str {
        if !self.found {
            "NOT_FOUND"
        } else if !self.idam_crc_valid {
            "IDAM_CRC_ERROR"
        } else if !self.data_block_found {
            "NO_DATA_BLOCK"
        } else if !self.data_crc_valid {
            "DATA_CRC_ERROR"
        } else {
            "OK"
        }
    }
}

/// Result of parsing an entire track.
#[derive(Debug, Clone, Default)]
pub struct TrackParse {
    pub sectors_found: usize,
    pub valid_sectors: usize,
    pub sectors: [SectorParse; SECTORS_PER_TRACK],
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl TrackParse {
    /// All 16 sectors present and fully valid.
    pub fn is_compliant(&self) -> bool {
        self.valid_sectors == SECTORS_PER_TRACK
    }

    pub fn dump(&self) -> String {
        use fmt::Write;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Track parse: {}/16 sectors found, {} valid",
            self.sectors_found, self.valid_sectors
        );
        for (i, s) in self.sectors.iter().enumerate() {
            if !s.found {
                let _ = writeln!(out, "  Sector {}: NOT FOUND", i + 1);
            } else {
                let _ = writeln!(
                    out,
                    "  Sector {}: C{} H{} S{} ({}B) @{} [{}]{}",
                    i + 1,
                    s.cylinder,
                    s.head,
                    s.sector_no,
                    s.sector_size(),
                    s.idam_offset,
                    s.status(),
                    if s.error.is_empty() {
                        String::new()
                    } else {
                        format!(" - {}", s.error)
                    }
                );
            }
        }
        for e in &self.errors {
            let _ = writeln!(out, "ERROR: {e}");
        }
        for w in &self.warnings {
            let _ = writeln!(out, "WARNING: {w}");
        }
        out
    }
}

/// Scans raw track bytes for sector structure.
pub struct MfmParser;

impl MfmParser {
    pub fn parse_track(raw: &[u8]) -> TrackParse {
        let mut result = TrackParse::default();

        if raw.len() < 100 {
            result.errors.push("Track data too short to parse".into());
            return result;
        }

        let mut pos = 0;
        while pos + 20 < raw.len() {
            if Self::sync_at(raw, pos) {
                let mark = raw[pos + 3];
                if mark == IDAM {
                    let sector = Self::parse_sector(raw, pos);
                    if sector.found && (1..=SECTORS_PER_TRACK as u8).contains(&sector.sector_no) {
                        let idx = sector.sector_no as usize - 1;
                        if result.sectors[idx].found {
                            result
                                .warnings
                                .push(format!("Duplicate sector {}", sector.sector_no));
                        }
                        let was_valid = result.sectors[idx].is_valid();
                        if sector.is_valid() {
                            if !was_valid {
                                result.valid_sectors += 1;
                            }
                        } else if was_valid {
                            result.valid_sectors -= 1;
                        }
                        result.sectors[idx] = sector;
                        result.sectors_found += 1;

                        // Skip past the record so it isn't re-parsed
                        pos += 50;
                    }
                }
            }
            pos += 1;
        }

        for (i, s) in result.sectors.iter().enumerate() {
            if !s.found {
                result.errors.push(format!("Sector {} not found", i + 1));
            }
        }

        result
    }

    fn sync_at(raw: &[u8], pos: usize) -> bool {
        pos + 3 < raw.len()
            && raw[pos] == SYNC_BYTE
            && raw[pos + 1] == SYNC_BYTE
            && raw[pos + 2] == SYNC_BYTE
    }

    fn parse_sector(raw: &[u8], sync_pos: usize) -> SectorParse {
        let mut result = SectorParse::default();

        let idam_pos = sync_pos + 3;
        if idam_pos + IDAM_SIZE > raw.len() {
            result.error = "IDAM truncated".into();
            return result;
        }

        result.found = true;
        result.idam_offset = idam_pos;
        result.cylinder = raw[idam_pos + 1];
        result.head = raw[idam_pos + 2];
        result.sector_no = raw[idam_pos + 3];
        result.size_code = raw[idam_pos + 4];
        result.idam_crc_expected = u16::from_le_bytes([raw[idam_pos + 5], raw[idam_pos + 6]]);

        result.idam_crc_calculated = crc_wd1793(&raw[idam_pos..idam_pos + 5]);
        result.idam_crc_valid = result.idam_crc_expected == result.idam_crc_calculated;
        if !result.idam_crc_valid {
            result.error = "IDAM CRC mismatch".into();
        }

        // DAM sits in a narrow window after the IDAM: gap2 + sync run.
        let search_start = idam_pos + IDAM_SIZE + 20;
        let search_end = (idam_pos + IDAM_SIZE + 60).min(raw.len().saturating_sub(4));

        for dam_pos in search_start..search_end {
            if !Self::sync_at(raw, dam_pos) {
                continue;
            }
            let mark = raw[dam_pos + 3];
            if mark != DAM && mark != DDAM {
                continue;
            }

            result.data_block_found = true;
            result.deleted_data = mark == DDAM;
            result.data_offset = dam_pos + 4;

            let data_size = result.sector_size();
            if result.data_offset + data_size + 2 <= raw.len() {
                // CRC covers the mark byte plus the payload
                result.data_crc_calculated = crc_wd1793(&raw[dam_pos + 3..dam_pos + 4 + data_size]);
                let crc_pos = result.data_offset + data_size;
                result.data_crc_expected = u16::from_le_bytes([raw[crc_pos], raw[crc_pos + 1]]);
                result.data_crc_valid = result.data_crc_expected == result.data_crc_calculated;
                if !result.data_crc_valid && result.error.is_empty() {
                    result.error = "Data CRC mismatch".into();
                }
            }
            break;
        }

        if !result.data_block_found && result.error.is_empty() {
            result.error = "Data block not found".into();
        }

        result
    }
}

// ── Validator ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// A triaged diagnostic with reasoning and a fix hint.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub code: &'static str,
    pub description: String,
    pub reason: String,
    pub hint: String,
    /// Affected sector number; `None` for track-level issues.
    pub sector_no: Option<u8>,
    pub offset: usize,
}

/// Parse result plus the triaged issue list.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub parse: TrackParse,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues
            .iter()
            .filter(|i| i.severity >= Severity::Error)
    }

    pub fn report(&self) -> String {
        use fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "=== MFM Track Validation Report ===");
        let _ = writeln!(out, "Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        let _ = writeln!(out, "Sectors: {}/16 valid", self.parse.valid_sectors);
        let _ = writeln!(out);

        if self.issues.is_empty() {
            let _ = writeln!(out, "No issues found.");
        } else {
            let _ = writeln!(out, "Issues ({}):", self.issues.len());
            for issue in &self.issues {
                let _ = write!(out, "\n[{}] {}", issue.severity, issue.code);
                if let Some(no) = issue.sector_no {
                    let _ = write!(out, " (Sector {no})");
                }
                let _ = writeln!(out);
                let _ = writeln!(out, "  Description: {}", issue.description);
                let _ = writeln!(out, "  Reason: {}", issue.reason);
                let _ = writeln!(out, "  Hint: {}", issue.hint);
            }
        }

        out
    }
}

/// Validates parsed tracks and explains what went wrong.
pub struct MfmValidator;

impl MfmValidator {
    pub fn validate(raw: &[u8]) -> ValidationReport {
        let parse = MfmParser::parse_track(raw);
        let mut report = ValidationReport {
            passed: false,
            parse,
            issues: Vec::new(),
        };

        Self::triage_parse(&mut report);
        Self::check_preamble(raw, &mut report);
        Self::check_interleave(&mut report);

        let has_errors = report.errors().next().is_some();
        report.passed = report.parse.is_compliant() && !has_errors;
        report
    }

    fn triage_parse(report: &mut ValidationReport) {
        for i in 0..SECTORS_PER_TRACK {
            let s = report.parse.sectors[i].clone();
            let sector_no = (i + 1) as u8;

            if !s.found {
                report.issues.push(Issue {
                    severity: Severity::Error,
                    code: "SECTOR_NOT_FOUND",
                    description: format!("Sector {sector_no} not found in track data"),
                    reason: "The ID Address Mark (A1 A1 A1 FE) sequence for this sector was not detected".into(),
                    hint: "Check that the format stream wrote all 16 sectors and that sector number fields are correct".into(),
                    sector_no: Some(sector_no),
                    offset: 0,
                });
                continue;
            }

            if !s.idam_crc_valid {
                report.issues.push(Issue {
                    severity: Severity::Error,
                    code: "IDAM_CRC_MISMATCH",
                    description: format!("Sector {sector_no} IDAM CRC invalid"),
                    reason: format!(
                        "CRC expected: 0x{:04X}, calculated: 0x{:04X}",
                        s.idam_crc_expected, s.idam_crc_calculated
                    ),
                    hint: "Verify F7 (CRC write) was sent after the IDAM fields and F5 preset before FE".into(),
                    sector_no: Some(sector_no),
                    offset: s.idam_offset,
                });
            }

            if !s.data_block_found {
                report.issues.push(Issue {
                    severity: Severity::Error,
                    code: "DATA_BLOCK_MISSING",
                    description: format!("Sector {sector_no} data block not found"),
                    reason: "No Data Address Mark (A1 A1 A1 FB) found after the IDAM".into(),
                    hint: "Verify gap and sync bytes were written, and the F5 F5 F5 FB sequence after the gap".into(),
                    sector_no: Some(sector_no),
                    offset: s.idam_offset,
                });
            } else if !s.data_crc_valid {
                report.issues.push(Issue {
                    severity: Severity::Warning,
                    code: "DATA_CRC_MISMATCH",
                    description: format!("Sector {sector_no} data CRC invalid"),
                    reason: format!(
                        "CRC expected: 0x{:04X}, calculated: 0x{:04X}",
                        s.data_crc_expected, s.data_crc_calculated
                    ),
                    hint: "Verify F7 was sent after all data bytes and the byte count matches the sector size".into(),
                    sector_no: Some(sector_no),
                    offset: s.data_offset,
                });
            }

            if s.sector_no != sector_no {
                report.issues.push(Issue {
                    severity: Severity::Warning,
                    code: "SECTOR_NUMBER_MISMATCH",
                    description: format!(
                        "Sector at position {i} advertises number {}",
                        s.sector_no
                    ),
                    reason: "Sector number in the IDAM does not match its table position".into(),
                    hint: "Check the interleave table and sector numbering; TR-DOS uses 1-16".into(),
                    sector_no: Some(sector_no),
                    offset: s.idam_offset,
                });
            }
        }
    }

    fn check_preamble(raw: &[u8], report: &mut ValidationReport) {
        let gap = raw
            .iter()
            .take(50)
            .take_while(|&&b| b == GAP_BYTE)
            .count();
        if gap < 10 {
            report.issues.push(Issue {
                severity: Severity::Warning,
                code: "SMALL_PREAMBLE_GAP",
                description: format!("Track preamble gap is only {gap} bytes"),
                reason: "Standard format expects 10+ bytes of 0x4E before the first sector".into(),
                hint: "May cause read timing issues on real hardware".into(),
                sector_no: None,
                offset: 0,
            });
        }
    }

    fn check_interleave(report: &mut ValidationReport) {
        const TRDOS_INTERLEAVE: [u8; 16] = [1, 9, 2, 10, 3, 11, 4, 12, 5, 13, 6, 14, 7, 15, 8, 16];

        let mut by_offset: Vec<(usize, u8)> = report
            .parse
            .sectors
            .iter()
            .filter(|s| s.found)
            .map(|s| (s.idam_offset, s.sector_no))
            .collect();
        if by_offset.len() != SECTORS_PER_TRACK {
            return;
        }
        by_offset.sort();

        let standard = by_offset
            .iter()
            .zip(TRDOS_INTERLEAVE.iter())
            .all(|((_, got), want)| got == want);
        if !standard {
            report.issues.push(Issue {
                severity: Severity::Info,
                code: "NON_STANDARD_INTERLEAVE",
                description: "Sector interleave does not match TR-DOS standard (1:2)".into(),
                reason: "Physical sector order differs from the expected 1,9,2,10,3,11...".into(),
                hint: "May be intentional for copy protection or another DOS; non-standard but functional".into(),
                sector_no: None,
                offset: 0,
            });
        }
    }
}
