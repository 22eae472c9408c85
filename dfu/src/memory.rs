//! DfuSe memory map, parsed from the interface-name string.
//!
//! DfuSe bootloaders publish their memory layout in the alternate
//! setting's interface name, for example
//! `@Internal Flash/0x08000000/16*001Kg,48*001Kg`.

use nonempty::NonEmpty;
use regex::Regex;

use crate::error::DfuError;

/// One contiguous run of identically sized sectors with uniform
/// permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSegment {
    start: u32,
    end: u32,
    sector_size: u32,
    mem_type: u8,
}

impl MemSegment {
    /// First address of the segment.
    pub fn start(&self) -> u32 {
        self.start
    }
    /// One past the last address of the segment.
    pub fn end(&self) -> u32 {
        self.end
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn sectors(&self) -> u32 {
        (self.end - self.start) / self.sector_size
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Index of the sector containing `addr`.
    pub fn sector_index(&self, addr: u32) -> u32 {
        (addr - self.start) / self.sector_size
    }

    /// First address of the sector containing `addr`.
    pub fn sector_start(&self, addr: u32) -> u32 {
        self.start + self.sector_index(addr) * self.sector_size
    }

    /// One past the last address of the sector containing `addr`.
    pub fn sector_end(&self, addr: u32) -> u32 {
        self.sector_start(addr) + self.sector_size
    }
}

/// Memory layout of one DfuSe alternate setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub name: String,
    pub segments: NonEmpty<MemSegment>,
}

impl MemoryMap {
    /// Parse a DfuSe interface-name string.
    pub fn parse(descriptor: &str) -> Result<Self, DfuError> {
        parse_memory_map(descriptor)
    }

    /// The segment containing `addr`, if any.
    pub fn segment_for(&self, addr: u32) -> Option<&MemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Largest contiguous readable byte count starting at `addr`.
    ///
    /// Stops at the first gap between segments or at the first segment
    /// that is not readable.
    pub fn contiguous_readable_from(&self, addr: u32) -> u32 {
        let mut bytes = 0u32;
        for segment in self.segments.iter() {
            if bytes == 0 {
                if segment.contains(addr) {
                    if !segment.readable() {
                        break;
                    }
                    bytes = segment.end - addr;
                }
            } else if segment.start == addr + bytes && segment.readable() {
                bytes += segment.end - segment.start;
            } else {
                break;
            }
        }
        bytes
    }

    /// First segment that can be written.
    pub fn first_writable(&self) -> Option<&MemSegment> {
        self.segments.iter().find(|s| s.writable())
    }
}

/// Parse `@<name>/<addr>/<runs>[/<addr>/<runs>]*` into a [`MemoryMap`].
///
/// Each run is `<count>*<size><unit><perm>` where the unit is a space or
/// `B` for bytes, `K` for KiB, `M` for MiB, and the permission letter
/// a..g encodes readable/erasable/writable in its low three bits.
pub(crate) fn parse_memory_map(descriptor: &str) -> Result<MemoryMap, DfuError> {
    let body = descriptor.strip_prefix('@').ok_or_else(|| {
        DfuError::MalformedMemoryMap(format!("missing '@' prefix in {descriptor:?}"))
    })?;

    let run_re = Regex::new(r"(\d+)\*(\d+)([KMB ])([a-g])").unwrap();

    let mut parts = body.split('/');
    let name = parts.next().unwrap_or_default().trim().to_string();

    let mut segments = Vec::new();
    while let Some(addr_part) = parts.next() {
        let addr_part = addr_part.trim();
        let base = addr_part
            .strip_prefix("0x")
            .and_then(|hex| u32::from_str_radix(hex.trim_end_matches('U'), 16).ok())
            .ok_or_else(|| {
                DfuError::MalformedMemoryMap(format!("bad base address {addr_part:?}"))
            })?;
        let runs = parts.next().ok_or_else(|| {
            DfuError::MalformedMemoryMap(format!("address {addr_part} without sector runs"))
        })?;

        let mut current = base;
        for run in run_re.captures_iter(runs) {
            let count: u32 = run[1].parse().map_err(|_| {
                DfuError::MalformedMemoryMap(format!("bad sector count in {runs:?}"))
            })?;
            let size: u32 = run[2].parse().map_err(|_| {
                DfuError::MalformedMemoryMap(format!("bad sector size in {runs:?}"))
            })?;
            let sector_size = match &run[3] {
                "K" => size * 1024,
                "M" => size * 1024 * 1024,
                _ => size,
            };
            if count == 0 || sector_size == 0 {
                return Err(DfuError::MalformedMemoryMap(format!(
                    "empty sector run in {runs:?}"
                )));
            }
            let mem_type = run[4].as_bytes()[0] & 7;

            let end = count
                .checked_mul(sector_size)
                .and_then(|bytes| current.checked_add(bytes))
                .ok_or_else(|| {
                    DfuError::MalformedMemoryMap(format!("segment overflows in {runs:?}"))
                })?;
            segments.push(MemSegment {
                start: current,
                end,
                sector_size,
                mem_type,
            });
            current = end;
        }
    }

    NonEmpty::from_vec(segments)
        .map(|segments| MemoryMap { name, segments })
        .ok_or_else(|| {
            DfuError::MalformedMemoryMap(format!("no valid segment in {descriptor:?}"))
        })
}
