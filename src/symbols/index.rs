//! ELF/DWARF indexing and fuzzy name resolution.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use gimli::{DebugInfoOffset, EndianRcSlice, Reader as _, RunTimeEndian};
use log::debug;
use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};

use super::{maps, RegionResolver};
use crate::domain::errors::ResolveError;

type Reader = EndianRcSlice<RunTimeEndian>;

/// One inlining site of a function: `[low, high)` unbiased addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlinedRange {
    pub low: u64,
    pub high: u64,
}

#[derive(Debug, Clone)]
struct LineAddr {
    file: String,
    addr: u64,
}

/// Immutable address tables for one ELF file.
///
/// Table construction is fault-tolerant per table: a stripped symbol table
/// leaves `funcs` empty, missing DWARF leaves `lines` and `inlined` empty,
/// and the corresponding lookups report what is missing.
pub struct BinaryIndex {
    pie: bool,
    name: String,
    funcs: HashMap<String, u64>,
    inlined: HashMap<String, Vec<InlinedRange>>,
    lines: HashMap<u32, Vec<LineAddr>>,
}

impl BinaryIndex {
    /// Parse the ELF file at `path` and build the lookup tables.
    ///
    /// # Errors
    /// Fails when the file cannot be read, is not valid ELF, or is neither
    /// an executable nor a shared object (ET_EXEC / ET_DYN).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&data, name)
    }

    /// Index the binary of a running process, resolved via `/proc/<pid>/exe`.
    ///
    /// # Errors
    /// Same as [`BinaryIndex::open`], plus failure to read the proc link.
    pub fn from_pid(pid: i32) -> Result<Self, ResolveError> {
        Self::open(maps::exe_path(pid)?)
    }

    /// Build the index from raw ELF bytes. `name` is the basename used to
    /// locate the executable mapping in `/proc/<pid>/maps` later.
    pub fn parse(data: &[u8], name: String) -> Result<Self, ResolveError> {
        let obj = object::File::parse(data)?;

        let pie = match obj.kind() {
            ObjectKind::Dynamic => true,
            ObjectKind::Executable => false,
            _ => return Err(ResolveError::InvalidElfType),
        };

        // Addresses are stored relative to the first loadable segment so
        // that adding the runtime mapping base yields a live address. For
        // fixed-position executables the file addresses are already live.
        let load_ref = if pie {
            obj.segments().next().map(|s| s.address()).unwrap_or(0)
        } else {
            0
        };

        let mut index = Self {
            pie,
            name,
            funcs: HashMap::new(),
            inlined: HashMap::new(),
            lines: HashMap::new(),
        };

        index.index_functions(&obj, load_ref);
        if let Err(e) = index.index_dwarf(&obj, load_ref) {
            debug!("no usable DWARF data: {e}");
        }

        Ok(index)
    }

    /// True if this executable is position-independent.
    pub fn pie(&self) -> bool {
        self.pie
    }

    fn index_functions(&mut self, obj: &object::File, load_ref: u64) {
        for sym in obj.symbols() {
            if sym.kind() != SymbolKind::Text {
                continue;
            }
            if let Ok(name) = sym.name() {
                if !name.is_empty() {
                    self.funcs
                        .insert(name.to_string(), sym.address().wrapping_sub(load_ref));
                }
            }
        }
    }

    /// Walk the DWARF once for both the inlined-subroutine and the line
    /// tables. Inlined subroutines are first collected keyed by their
    /// abstract-origin DIE offset, then a second pass over subprogram DIEs
    /// translates those offsets back into function names.
    fn index_dwarf(&mut self, obj: &object::File, load_ref: u64) -> Result<(), ResolveError> {
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut by_origin: HashMap<DebugInfoOffset, Vec<InlinedRange>> = HashMap::new();

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;

            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_inlined_subroutine {
                    continue;
                }
                let Some(origin) = abstract_origin(&unit, entry)? else {
                    continue;
                };
                let Some(low) = low_pc(&dwarf, &unit, entry)? else {
                    continue;
                };
                let Some(high) = high_pc(entry, low)? else {
                    continue;
                };
                by_origin.entry(origin).or_default().push(InlinedRange {
                    low: low.wrapping_sub(load_ref),
                    high: high.wrapping_sub(load_ref),
                });
            }

            self.index_lines(&dwarf, &unit, load_ref)?;
        }

        // Second pass: resolve origin offsets to subprogram names.
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                let Some(offset) = entry.offset().to_debug_info_offset(&unit.header) else {
                    continue;
                };
                let Some(ranges) = by_origin.remove(&offset) else {
                    continue;
                };
                if let Some(name) = entry_name(&dwarf, &unit, entry)? {
                    self.inlined.insert(name, ranges);
                }
            }
        }

        Ok(())
    }

    fn index_lines(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        unit: &gimli::Unit<Reader>,
        load_ref: u64,
    ) -> Result<(), ResolveError> {
        let Some(program) = unit.line_program.clone() else {
            return Ok(());
        };
        let mut rows = program.rows();
        while let Some((header, row)) = rows.next_row()? {
            if row.end_sequence() || !row.is_stmt() {
                continue;
            }
            let Some(line) = row.line() else {
                continue;
            };
            let file = match row.file(header) {
                Some(entry) => file_path(dwarf, unit, header, entry),
                None => String::from("<unknown>"),
            };
            self.add_line(file, line.get() as u32, row.address().wrapping_sub(load_ref));
        }
        Ok(())
    }

    /// Repeated (file, line) rows keep the lowest address: the address of
    /// the first instruction belonging to that line.
    fn add_line(&mut self, file: String, line: u32, addr: u64) {
        let entries = self.lines.entry(line).or_default();
        match entries.iter_mut().find(|e| e.file == file) {
            Some(existing) => {
                if addr < existing.addr {
                    existing.addr = addr;
                }
            }
            None => entries.push(LineAddr { file, addr }),
        }
    }

    /// Exact match first; otherwise the substring matches must identify a
    /// unique key.
    fn fuzzy_get<'m, T>(
        table: &'m HashMap<String, T>,
        query: &str,
    ) -> Result<&'m T, ResolveError> {
        if let Some(v) = table.get(query) {
            return Ok(v);
        }
        let mut matches: Vec<&String> = table.keys().filter(|k| k.contains(query)).collect();
        match matches.len() {
            1 => Ok(&table[matches[0]]),
            0 => Err(ResolveError::NotFound(query.to_string())),
            _ => {
                matches.sort();
                Err(ResolveError::AmbiguousMatches(
                    matches.into_iter().cloned().collect(),
                ))
            }
        }
    }

    #[cfg(test)]
    fn with_tables(
        funcs: HashMap<String, u64>,
        inlined: HashMap<String, Vec<InlinedRange>>,
        lines: HashMap<u32, Vec<(String, u64)>>,
    ) -> Self {
        Self {
            pie: false,
            name: String::from("test"),
            funcs,
            inlined,
            lines: lines
                .into_iter()
                .map(|(line, addrs)| {
                    let addrs = addrs
                        .into_iter()
                        .map(|(file, addr)| LineAddr { file, addr })
                        .collect();
                    (line, addrs)
                })
                .collect(),
        }
    }
}

impl RegionResolver for BinaryIndex {
    fn func_to_pc(&self, name: &str) -> Result<u64, ResolveError> {
        if self.funcs.is_empty() {
            return Err(ResolveError::NoSymbolTable);
        }
        Self::fuzzy_get(&self.funcs, name).copied()
    }

    fn inlined_func_to_pcs(&self, name: &str) -> Result<Vec<InlinedRange>, ResolveError> {
        if self.inlined.is_empty() {
            return Err(ResolveError::MissingDebugInfo);
        }
        Self::fuzzy_get(&self.inlined, name).cloned()
    }

    fn line_to_pc(&self, file: &str, line: u32) -> Result<u64, ResolveError> {
        if self.lines.is_empty() {
            return Err(ResolveError::MissingDebugInfo);
        }
        let location = || format!("{file}:{line}");
        let Some(addrs) = self.lines.get(&line) else {
            return Err(ResolveError::NotFound(location()));
        };

        let mut matches = Vec::new();
        for entry in addrs {
            if entry.file == file {
                return Ok(entry.addr);
            }
            if entry.file.contains(file) {
                matches.push(entry);
            }
        }
        match matches.len() {
            1 => Ok(matches[0].addr),
            0 => Err(ResolveError::NotFound(location())),
            _ => {
                let mut files: Vec<String> = matches.iter().map(|e| e.file.clone()).collect();
                files.sort();
                Err(ResolveError::AmbiguousMatches(files))
            }
        }
    }

    fn load_bias(&self, pid: i32) -> Result<u64, ResolveError> {
        if !self.pie {
            return Ok(0);
        }
        maps::read_bias(pid, &self.name)
    }
}

fn abstract_origin(
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<DebugInfoOffset>, ResolveError> {
    Ok(match entry.attr_value(gimli::DW_AT_abstract_origin)? {
        Some(gimli::AttributeValue::UnitRef(offset)) => offset.to_debug_info_offset(&unit.header),
        Some(gimli::AttributeValue::DebugInfoRef(offset)) => Some(offset),
        _ => None,
    })
}

fn low_pc(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<u64>, ResolveError> {
    Ok(match entry.attr_value(gimli::DW_AT_low_pc)? {
        Some(gimli::AttributeValue::Addr(addr)) => Some(addr),
        Some(gimli::AttributeValue::DebugAddrIndex(index)) => Some(dwarf.address(unit, index)?),
        _ => None,
    })
}

/// `DW_AT_high_pc` is either an address (class Address) or a length
/// relative to `DW_AT_low_pc` (class Constant).
fn high_pc(
    entry: &gimli::DebuggingInformationEntry<Reader>,
    low: u64,
) -> Result<Option<u64>, ResolveError> {
    let Some(attr) = entry.attr(gimli::DW_AT_high_pc)? else {
        return Ok(None);
    };
    Ok(match attr.value() {
        gimli::AttributeValue::Addr(addr) => Some(addr),
        _ => attr.udata_value().map(|len| low + len),
    })
}

fn entry_name(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<String>, ResolveError> {
    let Some(value) = entry.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let Ok(name) = dwarf.attr_string(unit, value) else {
        return Ok(None);
    };
    Ok(name.to_string_lossy().ok().map(|s| s.into_owned()))
}

fn file_path(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    entry: &gimli::FileEntry<Reader>,
) -> String {
    let name = dwarf
        .attr_string(unit, entry.path_name())
        .ok()
        .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()));
    let Some(name) = name else {
        return String::from("<unknown>");
    };
    if name.starts_with('/') {
        return name;
    }
    let dir = entry
        .directory(header)
        .and_then(|d| dwarf.attr_string(unit, d).ok())
        .and_then(|s| s.to_string_lossy().ok().map(|s| s.into_owned()));
    match dir {
        Some(dir) if !dir.is_empty() => format!("{dir}/{name}"),
        _ => name,
    }
}
