//! Z80 opcode profiler: execution statistics plus crash forensics.
//!
//! Two tiers:
//! - 1792 per-opcode execution counters (256 slots for each of the
//!   seven prefix groups), bumped with relaxed atomics on the
//!   emulation thread.
//! - A 10,000-entry ring of recent executions for post-mortem
//!   inspection.
//!
//! The `log()` writer path is wait-free: counters and ring words are
//! plain atomic stores. Readers (CLI/debugger threads) serialize on a
//! mutex and take snapshots; they may observe slightly stale data but
//! never torn 64-bit words.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

/// 256 opcodes × 7 prefix groups.
pub const COUNTER_TABLE_SIZE: usize = 1792;

/// Trace ring capacity.
pub const TRACE_CAPACITY: usize = 10_000;

// Prefix codes as they appear in the instruction stream.
pub const PREFIX_NONE: u16 = 0x0000;
pub const PREFIX_CB: u16 = 0x00CB;
pub const PREFIX_DD: u16 = 0x00DD;
pub const PREFIX_ED: u16 = 0x00ED;
pub const PREFIX_FD: u16 = 0x00FD;
pub const PREFIX_DDCB: u16 = 0xDDCB;
pub const PREFIX_FDCB: u16 = 0xFDCB;

/// Capture session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Capturing,
    Paused,
}

const STATE_STOPPED: u8 = 0;
const STATE_CAPTURING: u8 = 1;
const STATE_PAUSED: u8 = 2;

/// One trace ring entry, packed into two atomic words in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceEntry {
    pub pc: u16,
    pub prefix: u16,
    pub opcode: u8,
    pub flags: u8,
    pub a: u8,
    pub frame: u32,
    pub t_state: u32,
}

impl TraceEntry {
    fn pack(&self) -> (u64, u64) {
        let word0 = self.pc as u64
            | (self.prefix as u64) << 16
            | (self.opcode as u64) << 32
            | (self.flags as u64) << 40
            | (self.a as u64) << 48;
        let word1 = self.frame as u64 | (self.t_state as u64) << 32;
        (word0, word1)
    }

    fn unpack(word0: u64, word1: u64) -> Self {
        Self {
            pc: word0 as u16,
            prefix: (word0 >> 16) as u16,
            opcode: (word0 >> 32) as u8,
            flags: (word0 >> 40) as u8,
            a: (word0 >> 48) as u8,
            frame: word1 as u32,
            t_state: (word1 >> 32) as u32,
        }
    }
}

/// Counter report row.
#[derive(Debug, Clone)]
pub struct OpcodeCounter {
    pub prefix: u16,
    pub opcode: u8,
    pub count: u64,
    pub mnemonic: String,
}

/// Snapshot of profiler state.
#[derive(Debug, Clone, Copy)]
pub struct ProfilerStatus {
    pub capturing: bool,
    pub total_executions: u64,
    pub trace_size: u32,
    pub trace_capacity: u32,
}

pub struct OpcodeProfiler {
    state: AtomicU8,
    counters: Vec<AtomicU64>,
    trace: Vec<[AtomicU64; 2]>,
    trace_head: AtomicUsize,
    trace_count: AtomicUsize,
    /// Serializes readers; the log() writer never takes it.
    reader_lock: Mutex<()>,
}

impl OpcodeProfiler {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_STOPPED),
            counters: (0..COUNTER_TABLE_SIZE).map(|_| AtomicU64::new(0)).collect(),
            trace: (0..TRACE_CAPACITY)
                .map(|_| [AtomicU64::new(0), AtomicU64::new(0)])
                .collect(),
            trace_head: AtomicUsize::new(0),
            trace_count: AtomicUsize::new(0),
            reader_lock: Mutex::new(()),
        }
    }

    // ── Session control ────────────────────────────────────────

    /// Start a capture session, clearing previous data.
    pub fn start(&self) {
        let _guard = self.reader_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.clear_unlocked();
        self.state.store(STATE_CAPTURING, Ordering::Release);
    }

    /// Pause capturing; data is retained.
    pub fn pause(&self) {
        let _ = self.state.compare_exchange(
            STATE_CAPTURING,
            STATE_PAUSED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Resume a paused session. No effect in any other state.
    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            STATE_PAUSED,
            STATE_CAPTURING,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Stop capturing; data remains accessible. Idempotent.
    pub fn stop(&self) {
        self.state.store(STATE_STOPPED, Ordering::Release);
    }

    /// Zero all counters and the trace ring.
    pub fn clear(&self) {
        let _guard = self.reader_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.clear_unlocked();
    }

    fn clear_unlocked(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        for entry in &self.trace {
            entry[0].store(0, Ordering::Relaxed);
            entry[1].store(0, Ordering::Relaxed);
        }
        self.trace_head.store(0, Ordering::Relaxed);
        self.trace_count.store(0, Ordering::Relaxed);
    }

    pub fn is_capturing(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CAPTURING
    }

    pub fn session_state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CAPTURING => SessionState::Capturing,
            STATE_PAUSED => SessionState::Paused,
            _ => SessionState::Stopped,
        }
    }

    // ── Hot path ───────────────────────────────────────────────

    /// Record one opcode execution. No-op unless capturing.
    #[inline]
    pub fn log(&self, pc: u16, prefix: u16, opcode: u8, flags: u8, a: u8, frame: u32, t_state: u32) {
        if self.state.load(Ordering::Relaxed) != STATE_CAPTURING {
            return;
        }

        let index = Self::index_of(prefix, opcode);
        self.counters[index].fetch_add(1, Ordering::Relaxed);

        let head = self.trace_head.load(Ordering::Relaxed);
        let entry = TraceEntry {
            pc,
            prefix,
            opcode,
            flags,
            a,
            frame,
            t_state,
        };
        let (word0, word1) = entry.pack();
        self.trace[head][0].store(word0, Ordering::Relaxed);
        self.trace[head][1].store(word1, Ordering::Relaxed);

        self.trace_head
            .store((head + 1) % TRACE_CAPACITY, Ordering::Relaxed);

        // Saturates at capacity
        let count = self.trace_count.load(Ordering::Relaxed);
        if count < TRACE_CAPACITY {
            self.trace_count.store(count + 1, Ordering::Relaxed);
        }
    }

    // ── Retrieval ──────────────────────────────────────────────

    pub fn status(&self) -> ProfilerStatus {
        ProfilerStatus {
            capturing: self.is_capturing(),
            total_executions: self.total_executions(),
            trace_size: self.trace_count.load(Ordering::Relaxed) as u32,
            trace_capacity: TRACE_CAPACITY as u32,
        }
    }

    pub fn total_executions(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn count_of(&self, prefix: u16, opcode: u8) -> u64 {
        self.counters[Self::index_of(prefix, opcode)].load(Ordering::Relaxed)
    }

    /// Top `limit` opcodes by execution count, non-zero only, ties in
    /// table order.
    pub fn top(&self, limit: usize) -> Vec<OpcodeCounter> {
        let _guard = self.reader_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut result: Vec<OpcodeCounter> = Vec::new();
        for group in 0..7 {
            let prefix = Self::prefix_for_offset(group * 256);
            for op in 0..256usize {
                let count = self.counters[group * 256 + op].load(Ordering::Relaxed);
                if count > 0 {
                    result.push(OpcodeCounter {
                        prefix,
                        opcode: op as u8,
                        count,
                        mnemonic: Self::mnemonic(prefix, op as u8),
                    });
                }
            }
        }

        result.sort_by_key(|c| std::cmp::Reverse(c.count));
        result.truncate(limit);
        result
    }

    /// All non-zero counters in one prefix group, sorted by count.
    pub fn by_prefix(&self, prefix: u16) -> Vec<OpcodeCounter> {
        let _guard = self.reader_lock.lock().unwrap_or_else(|e| e.into_inner());

        let offset = Self::prefix_offset(prefix);
        let mut result: Vec<OpcodeCounter> = (0..256usize)
            .filter_map(|op| {
                let count = self.counters[offset + op].load(Ordering::Relaxed);
                (count > 0).then(|| OpcodeCounter {
                    prefix,
                    opcode: op as u8,
                    count,
                    mnemonic: Self::mnemonic(prefix, op as u8),
                })
            })
            .collect();

        result.sort_by_key(|c| std::cmp::Reverse(c.count));
        result
    }

    /// Last `count` trace entries, newest first.
    pub fn recent(&self, count: usize) -> Vec<TraceEntry> {
        let _guard = self.reader_lock.lock().unwrap_or_else(|e| e.into_inner());

        let size = self.trace_count.load(Ordering::Relaxed);
        let take = count.min(size);
        if take == 0 {
            return Vec::new();
        }

        let head = self.trace_head.load(Ordering::Relaxed);
        let mut result = Vec::with_capacity(take);
        for i in 0..take {
            let index = (head + TRACE_CAPACITY - 1 - i) % TRACE_CAPACITY;
            let word0 = self.trace[index][0].load(Ordering::Relaxed);
            let word1 = self.trace[index][1].load(Ordering::Relaxed);
            result.push(TraceEntry::unpack(word0, word1));
        }
        result
    }

    // ── Export ─────────────────────────────────────────────────

    /// Write a human-readable snapshot: status, top 100 counters and
    /// the last 100 trace entries. Returns false when the file cannot
    /// be created.
    pub fn save_to(&self, path: &Path) -> bool {
        let mut file = match File::create(path) {
            Ok(file) => file,
            Err(e) => {
                warn!("profiler: cannot create {}: {e}", path.display());
                return false;
            }
        };

        let status = self.status();
        let top = self.top(100);
        let trace = self.recent(100);

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut out = String::new();
        out.push_str("# Z80 Opcode Profile Export\n");
        out.push_str(&format!("# Generated: {stamp}\n\n"));

        out.push_str("status:\n");
        out.push_str(&format!("  capturing: {}\n", status.capturing));
        out.push_str(&format!("  total_executions: {}\n", status.total_executions));
        out.push_str(&format!("  trace_size: {}\n", status.trace_size));
        out.push_str(&format!("  trace_capacity: {}\n\n", status.trace_capacity));

        out.push_str("top_opcodes:\n");
        for op in &top {
            out.push_str(&format!(
                "  - prefix: 0x{:04x}  opcode: 0x{:02x}  mnemonic: \"{}\"  count: {}\n",
                op.prefix, op.opcode, op.mnemonic, op.count
            ));
        }

        out.push_str("\nrecent_trace:\n");
        for (i, t) in trace.iter().enumerate() {
            out.push_str(&format!(
                "  - idx: -{i}  pc: 0x{:04x}  prefix: 0x{:04x}  opcode: 0x{:02x}  flags: 0x{:02x}  a: 0x{:02x}  frame: {}  t_state: {}\n",
                t.pc, t.prefix, t.opcode, t.flags, t.a, t.frame, t.t_state
            ));
        }

        if let Err(e) = file.write_all(out.as_bytes()) {
            warn!("profiler: write to {} failed: {e}", path.display());
            return false;
        }
        true
    }

    // ── Index helpers ──────────────────────────────────────────

    fn index_of(prefix: u16, opcode: u8) -> usize {
        Self::prefix_offset(prefix) + opcode as usize
    }

    /// Unknown prefixes fall back to the non-prefixed group.
    fn prefix_offset(prefix: u16) -> usize {
        match prefix {
            PREFIX_NONE => 0,
            PREFIX_CB => 256,
            PREFIX_DD => 512,
            PREFIX_ED => 768,
            PREFIX_FD => 1024,
            PREFIX_DDCB => 1280,
            PREFIX_FDCB => 1536,
            _ => 0,
        }
    }

    fn prefix_for_offset(offset: usize) -> u16 {
        match offset {
            256 => PREFIX_CB,
            512 => PREFIX_DD,
            768 => PREFIX_ED,
            1024 => PREFIX_FD,
            1280 => PREFIX_DDCB,
            1536 => PREFIX_FDCB,
            _ => PREFIX_NONE,
        }
    }

    /// Hex rendering of prefix + opcode.
    pub fn mnemonic(prefix: u16, opcode: u8) -> String {
        if prefix == PREFIX_NONE {
            format!("{opcode:02X}")
        } else {
            format!("{prefix:04X} {opcode:02X}")
        }
    }
}

impl Default for OpcodeProfiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_counts_and_totals() {
        let profiler = OpcodeProfiler::new();
        profiler.start();

        profiler.log(0x8000, PREFIX_NONE, 0x00, 0x42, 0x55, 1, 100);
        profiler.log(0x8001, PREFIX_NONE, 0x00, 0x42, 0x55, 1, 104);
        profiler.log(0x8002, PREFIX_CB, 0x47, 0x42, 0x55, 1, 108);

        assert_eq!(profiler.count_of(PREFIX_NONE, 0x00), 2);
        assert_eq!(profiler.count_of(PREFIX_CB, 0x47), 1);
        assert_eq!(profiler.total_executions(), 3);

        let status = profiler.status();
        assert!(status.capturing);
        assert_eq!(status.total_executions, 3);
        assert_eq!(status.trace_size, 3);
        assert_eq!(status.trace_capacity, TRACE_CAPACITY as u32);
    }

    #[test]
    fn test_log_ignored_unless_capturing() {
        let profiler = OpcodeProfiler::new();
        // Stopped by default
        profiler.log(0, PREFIX_NONE, 0x00, 0, 0, 0, 0);
        assert_eq!(profiler.total_executions(), 0);

        profiler.start();
        profiler.pause();
        profiler.log(0, PREFIX_NONE, 0x00, 0, 0, 0, 0);
        assert_eq!(profiler.total_executions(), 0);

        profiler.resume();
        profiler.log(0, PREFIX_NONE, 0x00, 0, 0, 0, 0);
        assert_eq!(profiler.total_executions(), 1);

        // Resume from stopped is a no-op
        profiler.stop();
        profiler.stop(); // double stop is safe
        profiler.resume();
        assert_eq!(profiler.session_state(), SessionState::Stopped);
    }

    #[test]
    fn test_start_clears_previous_session() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        profiler.log(1, PREFIX_NONE, 0x3E, 0, 0, 0, 0);
        profiler.stop();

        profiler.start();
        assert_eq!(profiler.total_executions(), 0);
        assert_eq!(profiler.status().trace_size, 0);
        assert_eq!(profiler.session_state(), SessionState::Capturing);
    }

    #[test]
    fn test_clear_on_empty_is_safe() {
        let profiler = OpcodeProfiler::new();
        profiler.clear();
        assert_eq!(profiler.total_executions(), 0);
    }

    #[test]
    fn test_recent_newest_first() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        for i in 0..5u16 {
            profiler.log(0x4000 + i, PREFIX_NONE, i as u8, 0, 0, 0, i as u32);
        }

        let recent = profiler.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].pc, 0x4004);
        assert_eq!(recent[1].pc, 0x4003);
        assert_eq!(recent[2].pc, 0x4002);

        // min(n, trace_size) entries
        assert_eq!(profiler.recent(100).len(), 5);
        assert!(profiler.recent(0).is_empty());
    }

    #[test]
    fn test_ring_wraps_and_saturates() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        for i in 0..(TRACE_CAPACITY + 10) {
            profiler.log(i as u16, PREFIX_NONE, 0x00, 0, 0, 0, i as u32);
        }

        let status = profiler.status();
        assert_eq!(status.trace_size, TRACE_CAPACITY as u32);

        let recent = profiler.recent(1);
        assert_eq!(recent[0].t_state, (TRACE_CAPACITY + 9) as u32);
    }

    #[test]
    fn test_unknown_prefix_maps_to_offset_zero() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        profiler.log(0, 0x1234, 0x77, 0, 0, 0, 0);
        assert_eq!(profiler.count_of(PREFIX_NONE, 0x77), 1);
        assert_eq!(profiler.count_of(0x9999, 0x77), 1);
    }

    #[test]
    fn test_top_sorted_and_limited() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        for _ in 0..5 {
            profiler.log(0, PREFIX_NONE, 0x10, 0, 0, 0, 0);
        }
        for _ in 0..3 {
            profiler.log(0, PREFIX_ED, 0xB0, 0, 0, 0, 0);
        }
        profiler.log(0, PREFIX_NONE, 0x20, 0, 0, 0, 0);

        let top = profiler.top(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].opcode, 0x10);
        assert_eq!(top[0].count, 5);
        assert_eq!(top[1].prefix, PREFIX_ED);
        assert_eq!(top[1].count, 3);

        assert!(profiler.top(0).is_empty());
    }

    #[test]
    fn test_trace_entry_roundtrip() {
        let entry = TraceEntry {
            pc: 0xABCD,
            prefix: PREFIX_FDCB,
            opcode: 0xC6,
            flags: 0x99,
            a: 0x12,
            frame: 123_456,
            t_state: 70_000,
        };
        let (w0, w1) = entry.pack();
        assert_eq!(TraceEntry::unpack(w0, w1), entry);
    }

    #[test]
    fn test_concurrent_reader_never_sees_torn_state() {
        use std::sync::Arc;

        let profiler = Arc::new(OpcodeProfiler::new());
        profiler.start();

        let writer = {
            let profiler = Arc::clone(&profiler);
            std::thread::spawn(move || {
                for i in 0..50_000u32 {
                    profiler.log(i as u16, PREFIX_NONE, 0x00, 0x42, 0x55, i, i);
                }
            })
        };

        // Reader snapshots while the writer hammers the ring
        for _ in 0..100 {
            let recent = profiler.recent(64);
            for entry in recent {
                assert_eq!(entry.opcode, 0x00);
                assert_eq!(entry.flags, 0x42);
                assert_eq!(entry.a, 0x55);
            }
            let _ = profiler.top(10);
        }

        writer.join().unwrap();
        assert_eq!(profiler.total_executions(), 50_000);
        assert_eq!(profiler.count_of(PREFIX_NONE, 0x00), 50_000);
    }

    #[test]
    fn test_save_to_file() {
        let profiler = OpcodeProfiler::new();
        profiler.start();
        profiler.log(0x1234, PREFIX_DD, 0x21, 0x01, 0xFF, 7, 1000);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.txt");
        assert!(profiler.save_to(&path));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("status:"));
        assert!(contents.contains("top_opcodes:"));
        assert!(contents.contains("recent_trace:"));
        assert!(contents.contains("total_executions: 1"));
        assert!(contents.contains("pc: 0x1234"));

        // Unopenable path reports failure
        let bad = dir.path().join("no-such-dir").join("profile.txt");
        assert!(!profiler.save_to(&bad));
    }
}
