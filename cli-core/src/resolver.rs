use std::cmp;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::mem;
use std::ops::Range;
use std::str::FromStr;

use addr2line::{demangle, gimli};
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader, Rel, Rela, SectionHeader, SectionTable, Sym};
use object::read::FileKind;
use object::Endianness;

use crate::profile::{Address, SymbolData};
use crate::util::get_basename;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DetailLevel {
    Objects,
    Symbols,
    Sources,
}

impl FromStr for DetailLevel {
    type Err = String;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "object" => Ok(DetailLevel::Objects),
            "symbol" => Ok(DetailLevel::Symbols),
            "source" => Ok(DetailLevel::Sources),
            _ => Err(format!("invalid detail level '{}'", string)),
        }
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            DetailLevel::Objects => "object",
            DetailLevel::Symbols => "symbol",
            DetailLevel::Sources => "source",
        };
        formatter.write_str(name)
    }
}

/// A `[start, end)` range which compares equal to any other range it
/// overlaps. Keying a `BTreeMap` with it turns the map into an interval
/// index: inserting an overlapping symbol lands on the existing entry,
/// which is exactly where conflict resolution wants to be.
#[derive(Copy, Clone, Debug)]
struct RangeKey {
    start: u64,
    end: u64,
}

impl PartialEq for RangeKey {
    fn eq(&self, other: &RangeKey) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for RangeKey {}

impl PartialOrd for RangeKey {
    fn partial_cmp(&self, other: &RangeKey) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RangeKey {
    fn cmp(&self, other: &RangeKey) -> cmp::Ordering {
        if self.end <= other.start {
            cmp::Ordering::Less
        } else if other.end <= self.start {
            cmp::Ordering::Greater
        } else {
            cmp::Ordering::Equal
        }
    }
}

#[derive(Clone, Debug)]
struct RawSymbol {
    size: u64,
    binding: u8,
    is_plt: bool,
    name: String,
}

impl RawSymbol {
    fn synthetic(size: u64) -> Self {
        RawSymbol {
            size,
            binding: elf::STB_LOCAL,
            is_plt: false,
            name: String::new(),
        }
    }
}

fn binding_rank(binding: u8) -> u8 {
    match binding {
        elf::STB_LOCAL => 0,
        elf::STB_WEAK => 1,
        _ => 2,
    }
}

/// Registers a symbol, resolving conflicts with anything it overlaps:
/// a sized symbol beats a zero-sized assembly label, otherwise the
/// higher binding wins (`LOCAL < WEAK < GLOBAL`).
fn insert_symbol(symbols: &mut BTreeMap<RangeKey, RawSymbol>, key: RangeKey, symbol: RawSymbol) {
    let existing_key = match symbols.get_key_value(&key) {
        None => {
            symbols.insert(key, symbol);
            return;
        }
        Some((&existing_key, existing)) => {
            let replace = if existing.size == 0 && symbol.size != 0 {
                true
            } else if existing.size != 0 && symbol.size == 0 {
                false
            } else {
                binding_rank(symbol.binding) > binding_rank(existing.binding)
            };

            if !replace {
                return;
            }

            existing_key
        }
    };

    symbols.remove(&existing_key);
    // The new range can be wider than the one it displaced, so it may
    // overlap further entries; reinsert until it finds its place.
    insert_symbol(symbols, key, symbol);
}

/// Fills the gaps between the loaded symbols with synthetic ones and
/// expands zero-sized assembly labels so that the table covers the whole
/// executable span, leaving only sub-4-byte residuals uncovered.
fn construct_fake_symbols(
    details: DetailLevel,
    base_address: u64,
    end_address: u64,
    base_name: &str,
    symbols: BTreeMap<RangeKey, RawSymbol>,
) -> BTreeMap<RangeKey, RawSymbol> {
    let mut output = BTreeMap::new();
    let mut prev_end = base_address;
    let mut iter = symbols.iter().peekable();
    while let Some((&key, symbol)) = iter.next() {
        if key.start > prev_end && key.start - prev_end >= 4 {
            let gap = RangeKey { start: prev_end, end: key.start };
            output.insert(gap, RawSymbol::synthetic(key.start - prev_end));
        }

        if symbol.size == 0 {
            // An assembly label; stretch it out to the next symbol.
            let new_end = match iter.peek() {
                Some(&(&next, _)) => next.start,
                None => end_address,
            };

            if new_end > key.start {
                let mut expanded = symbol.clone();
                expanded.size = new_end - key.start;
                expanded.name = format!("{}@{}", symbol.name, base_name);
                output.insert(RangeKey { start: key.start, end: new_end }, expanded);
                prev_end = new_end;
            }
        } else {
            output.insert(key, symbol.clone());
            prev_end = key.end;
        }
    }

    if end_address > prev_end && end_address - prev_end >= 4 {
        let mut tail = RawSymbol::synthetic(end_address - prev_end);
        if details == DetailLevel::Objects {
            tail.name = format!("whole@{}", base_name);
        }
        output.insert(RangeKey { start: prev_end, end: end_address }, tail);
    }

    output
}

fn pod_slice<T: object::pod::Pod>(data: &[u8]) -> Result<&[T], Box<dyn Error>> {
    let count = data.len() / mem::size_of::<T>();
    object::pod::slice_from_bytes(data, count)
        .map(|(slice, _)| slice)
        .map_err(|()| "malformed relocation section".into())
}

fn name_is(name: &[u8], expected: &str) -> bool {
    name == expected.as_bytes()
}

struct Builder {
    details: DetailLevel,
    base_address: u64,
    end_address: u64,
    uses_absolute_addresses: bool,
    plt_end_address: u64,
    symtab_loaded: bool,
    has_debug_link: bool,
    has_debug_info: bool,
    symbols: BTreeMap<RangeKey, RawSymbol>,
}

impl Builder {
    fn new(details: DetailLevel) -> Self {
        Builder {
            details,
            base_address: 0,
            end_address: 0,
            uses_absolute_addresses: false,
            plt_end_address: 0,
            symtab_loaded: false,
            has_debug_link: false,
            has_debug_info: false,
            symbols: BTreeMap::new(),
        }
    }

    fn scan_main(&mut self, data: &[u8]) -> Result<(), Box<dyn Error>> {
        match FileKind::parse(data)? {
            FileKind::Elf32 => self.scan_elf::<elf::FileHeader32<Endianness>>(data, true),
            FileKind::Elf64 => self.scan_elf::<elf::FileHeader64<Endianness>>(data, true),
            _ => Err("not an ELF file".into()),
        }
    }

    fn scan_debug(&mut self, data: &[u8]) -> Result<(), Box<dyn Error>> {
        match FileKind::parse(data)? {
            FileKind::Elf32 => self.scan_elf::<elf::FileHeader32<Endianness>>(data, false),
            FileKind::Elf64 => self.scan_elf::<elf::FileHeader64<Endianness>>(data, false),
            _ => Err("not an ELF file".into()),
        }
    }

    fn scan_elf<Elf>(&mut self, data: &[u8], is_main: bool) -> Result<(), Box<dyn Error>>
    where
        Elf: FileHeader<Endian = Endianness>,
    {
        let header = Elf::parse(data)?;
        let endian = header.endian()?;

        if is_main {
            self.uses_absolute_addresses = header.e_type(endian) == elf::ET_EXEC;

            let mut base_address = u64::MAX;
            let mut end_address = 0;
            for segment in header.program_headers(endian, data)? {
                if segment.p_type(endian) != elf::PT_LOAD {
                    continue;
                }

                let address: u64 = segment.p_vaddr(endian).into();
                base_address = cmp::min(base_address, address);
                if segment.p_flags(endian) & elf::PF_X != 0 {
                    let size: u64 = segment.p_memsz(endian).into();
                    end_address = cmp::max(end_address, address + size);
                }
            }

            if base_address != u64::MAX {
                self.base_address = base_address;
            }
            self.end_address = end_address;
        }

        let sections = header.sections(endian, data)?;
        let mut has_symtab = false;
        let mut has_dynsym = false;
        let mut plt = None;
        let mut rel_plt: Option<&Elf::SectionHeader> = None;
        let mut rela_plt: Option<&Elf::SectionHeader> = None;

        for section in sections.iter() {
            let kind = section.sh_type(endian);
            if kind == elf::SHT_SYMTAB {
                has_symtab = true;
                continue;
            }
            if kind == elf::SHT_DYNSYM {
                has_dynsym = true;
                continue;
            }
            if kind != elf::SHT_PROGBITS && kind != elf::SHT_REL && kind != elf::SHT_RELA {
                continue;
            }

            let name = match sections.section_name(endian, section) {
                Ok(name) => name,
                Err(_) => continue,
            };

            if kind == elf::SHT_PROGBITS {
                if name_is(name, ".plt") {
                    let address: u64 = section.sh_addr(endian).into();
                    let entry_size: u64 = section.sh_entsize(endian).into();
                    plt = Some((address, entry_size));
                } else if name_is(name, ".gnu_debuglink") {
                    self.has_debug_link = true;
                } else if name_is(name, ".debug_info") {
                    self.has_debug_info = true;
                }
            } else if kind == elf::SHT_REL && name_is(name, ".rel.plt") {
                rel_plt = Some(section);
            } else if kind == elf::SHT_RELA && name_is(name, ".rela.plt") {
                rela_plt = Some(section);
            }
        }

        if self.details != DetailLevel::Objects && is_main && has_dynsym {
            if let Some((plt_address, plt_entry_size)) = plt {
                if plt_entry_size > 0 && (rel_plt.is_some() || rela_plt.is_some()) {
                    let mut targets = Vec::new();
                    if let Some(section) = rel_plt {
                        let rels = pod_slice::<Elf::Rel>(section.data(endian, data)?)?;
                        targets.extend(rels.iter().map(|rel| rel.r_sym(endian)));
                    }
                    if let Some(section) = rela_plt {
                        let is_mips64el = header.is_mips64el(endian);
                        let relas = pod_slice::<Elf::Rela>(section.data(endian, data)?)?;
                        targets.extend(relas.iter().map(|rela| rela.r_sym(endian, is_mips64el)));
                    }

                    let dynsyms = sections.symbols(endian, data, elf::SHT_DYNSYM)?;
                    let mut start = plt_address;
                    for target in targets {
                        let name = dynsyms
                            .symbol(target as usize)
                            .and_then(|symbol| dynsyms.symbol_name(endian, symbol))
                            .map(|name| String::from_utf8_lossy(name).into_owned())
                            .unwrap_or_default();

                        let key = RangeKey { start, end: start + plt_entry_size };
                        let symbol = RawSymbol {
                            size: plt_entry_size,
                            binding: elf::STB_GLOBAL,
                            is_plt: true,
                            name,
                        };
                        insert_symbol(&mut self.symbols, key, symbol);
                        start += plt_entry_size;
                    }

                    self.plt_end_address = start;
                }
            }
        }

        if self.details != DetailLevel::Objects {
            if has_symtab {
                self.load_symbols::<Elf>(endian, data, &sections, elf::SHT_SYMTAB)?;
                self.symtab_loaded = true;
            } else if is_main && has_dynsym {
                self.load_symbols::<Elf>(endian, data, &sections, elf::SHT_DYNSYM)?;
            }
        }

        Ok(())
    }

    fn load_symbols<'data, Elf>(
        &mut self,
        endian: Endianness,
        data: &'data [u8],
        sections: &SectionTable<'data, Elf, &'data [u8]>,
        sh_type: u32,
    ) -> Result<(), Box<dyn Error>>
    where
        Elf: FileHeader<Endian = Endianness>,
    {
        // A regular table overrides whatever was loaded beyond the PLT
        // stubs; the stubs themselves always stay.
        let plt_end_address = self.plt_end_address;
        self.symbols
            .retain(|key, symbol| symbol.is_plt || key.start < plt_end_address);

        let table = sections.symbols(endian, data, sh_type)?;
        for symbol in table.iter() {
            if symbol.st_type() != elf::STT_FUNC || symbol.st_shndx(endian) == elf::SHN_UNDEF {
                continue;
            }

            let start: u64 = symbol.st_value(endian).into();
            let size: u64 = symbol.st_size(endian).into();
            let name = table
                .symbol_name(endian, symbol)
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .unwrap_or_default();

            let key = RangeKey { start, end: start + cmp::max(size, 1) };
            let raw = RawSymbol {
                size,
                binding: symbol.st_bind(),
                is_plt: false,
                name,
            };
            insert_symbol(&mut self.symbols, key, raw);
        }

        Ok(())
    }

    fn into_symbols(self, base_name: &str) -> Vec<(Range<Address>, SymbolData)> {
        let details = self.details;
        let filled = construct_fake_symbols(
            details,
            self.base_address,
            self.end_address,
            base_name,
            self.symbols,
        );

        filled
            .into_iter()
            .map(|(key, symbol)| {
                let name = if symbol.name.is_empty() {
                    String::new()
                } else {
                    let mut name = demangle(&symbol.name, gimli::DW_LANG_C_plus_plus)
                        .unwrap_or_else(|| symbol.name.clone());
                    if symbol.is_plt {
                        name.push_str("@plt");
                    }
                    name
                };

                (key.start..key.end, SymbolData::new(name, symbol.is_plt))
            })
            .collect()
    }
}

/// Per-object symbol and source resolver.
///
/// Construction reads the object's ELF file (and possibly its detached
/// debug file) into memory, builds a symbol table covering the whole
/// executable span and, at the highest detail level, a DWARF line-lookup
/// context. All file data is dropped again before construction returns;
/// the line context keeps its own copies of the sections it needs.
pub struct AddressResolver {
    base_address: u64,
    end_address: u64,
    uses_absolute_addresses: bool,
    symbols: Vec<(Range<Address>, SymbolData)>,
    context: Option<addr2line::ObjectContext>,
}

impl AddressResolver {
    /// `fallback_end` sizes the synthetic whole-object symbol used when
    /// the ELF file cannot be read at all, so that the object's samples
    /// still resolve to something.
    pub fn new(details: DetailLevel, file_name: &str, fallback_end: u64) -> Self {
        let mut builder = Builder::new(details);

        let main_data = fs::read(file_name);
        let mut scanned = false;
        match main_data {
            Ok(ref data) => match builder.scan_main(data) {
                Ok(()) => scanned = true,
                Err(error) => debug!("Failed to scan {}: {}", file_name, error),
            },
            Err(ref error) => debug!("Can't open {}: {}", file_name, error),
        }

        if !scanned {
            builder = Builder::new(details);
            builder.end_address = fallback_end;
        }

        let mut debug_data = None;
        if scanned && builder.has_debug_link && details != DetailLevel::Objects {
            let debug_path = format!("/usr/lib/debug{}.debug", file_name);
            match fs::read(&debug_path) {
                Ok(data) => debug_data = Some(data),
                Err(error) => debug!("Can't open {}: {}", debug_path, error),
            }

            if !builder.symtab_loaded {
                if let Some(ref data) = debug_data {
                    if let Err(error) = builder.scan_debug(data) {
                        debug!("Failed to scan the debug file for {}: {}", file_name, error);
                    }
                }
            }
        }

        let base_address = builder.base_address;
        let end_address = builder.end_address;
        let uses_absolute_addresses = builder.uses_absolute_addresses;
        let has_debug_info = builder.has_debug_info;
        let symbols = builder.into_symbols(get_basename(file_name));

        let mut context = None;
        if details == DetailLevel::Sources {
            // The detached debug file wins when it exists; the main file
            // is only worth parsing when it carries debug sections.
            let module_data = if debug_data.is_some() {
                debug_data.as_ref()
            } else if has_debug_info {
                main_data.as_ref().ok()
            } else {
                None
            };

            context = module_data.and_then(|data| {
                let file = object::File::parse(&**data).ok()?;
                addr2line::Context::new(&file).ok()
            });

            if context.is_none() {
                debug!("No line information available for {}", file_name);
            }
        }

        AddressResolver {
            base_address,
            end_address,
            uses_absolute_addresses,
            symbols,
            context,
        }
    }

    #[inline]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    #[inline]
    pub fn end_address(&self) -> u64 {
        self.end_address
    }

    #[inline]
    pub fn uses_absolute_addresses(&self) -> bool {
        self.uses_absolute_addresses
    }

    /// The constructed symbol table, sorted by address.
    #[inline]
    pub fn symbols(&self) -> &[(Range<Address>, SymbolData)] {
        &self.symbols
    }

    /// Moves the symbol table out of the resolver; source lookups keep
    /// working afterwards.
    pub fn take_symbols(&mut self) -> Vec<(Range<Address>, SymbolData)> {
        mem::replace(&mut self.symbols, Vec::new())
    }

    /// Source file and line for an ELF-space address. The line tables of
    /// the access library are keyed by ELF virtual addresses, so no
    /// extra bias is applied.
    pub fn source_position(&self, address: Address) -> Option<(&str, u32)> {
        let context = self.context.as_ref()?;
        let location = context.find_location(address).ok()??;
        let file = location.file?;
        Some((file, location.line.unwrap_or(0)))
    }
}
