use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::mem;
use std::num::NonZeroU32;
use std::ops::Range;
use std::str::FromStr;

use common::event::{
    MmapRecord,
    Record,
    SampleRecord,
    MAX_STACK_DEPTH,
    PERF_CONTEXT_MAX,
    PERF_CONTEXT_USER
};
use common::range_map::RangeMap;

use crate::reader::parse_records;
use crate::resolver::{AddressResolver, DetailLevel};

pub type Address = u64;
pub type Count = u64;

pub type StringInterner = string_interner::StringInterner< StringId >;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StringId( NonZeroU32 );

impl string_interner::Symbol for StringId {
    #[inline]
    fn from_usize( value: usize ) -> Self {
        unsafe {
            StringId( NonZeroU32::new_unchecked( (value + 1) as u32 ) )
        }
    }

    #[inline]
    fn to_usize( self ) -> usize {
        self.0.get() as usize - 1
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    Flat,
    CallGraph
}

impl FromStr for Mode {
    type Err = String;

    fn from_str( string: &str ) -> Result< Self, Self::Err > {
        match string {
            "flat" => Ok( Mode::Flat ),
            "callgraph" => Ok( Mode::CallGraph ),
            _ => Err( format!( "invalid mode '{}'", string ) )
        }
    }
}

impl fmt::Display for Mode {
    fn fmt( &self, formatter: &mut fmt::Formatter ) -> fmt::Result {
        let name = match *self {
            Mode::Flat => "flat",
            Mode::CallGraph => "callgraph"
        };
        formatter.write_str( name )
    }
}

/// A source file and line, with the file interned in the profile-wide
/// string table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SourcePosition {
    pub file: StringId,
    pub line: u32
}

/// A resolved branch target: an index into the profile's memory objects
/// plus an index into that object's sorted symbol table. Ordering matches
/// address order since both sequences are address sorted.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct SymbolRef {
    pub object: u32,
    pub symbol: u32
}

/// The branch storage of a single entry.
///
/// Starts out keyed by raw callee addresses; the fixup pass rewrites it
/// to be keyed by resolved symbols, exactly once, and it is frozen as
/// soon as the containing object's fixup is finished. Only the raw state
/// accepts new branches; a late insert is an invariant violation which
/// release builds ignore.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) enum Branches {
    Raw( BTreeMap< Address, Count > ),
    Resolved( BTreeMap< SymbolRef, Count > ),
    Frozen( BTreeMap< SymbolRef, Count > )
}

impl Branches {
    fn new() -> Self {
        Branches::Raw( BTreeMap::new() )
    }

    fn add_raw( &mut self, callee: Address ) {
        match *self {
            Branches::Raw( ref mut branches ) => {
                *branches.entry( callee ).or_insert( 0 ) += 1;
            },
            _ => {
                debug_assert!( false, "branch insert after resolution" );
                warn!( "Ignoring a branch to 0x{:016X} recorded after branch resolution", callee );
            }
        }
    }

    fn resolve( &mut self, branches: BTreeMap< SymbolRef, Count > ) {
        match *self {
            Branches::Raw( _ ) => *self = Branches::Resolved( branches ),
            _ => {
                debug_assert!( false, "branches were already resolved" );
            }
        }
    }

    fn freeze( &mut self ) {
        if let Branches::Resolved( ref mut branches ) = *self {
            let branches = mem::replace( branches, BTreeMap::new() );
            *self = Branches::Frozen( branches );
        }
    }

    fn is_empty( &self ) -> bool {
        match *self {
            Branches::Raw( ref branches ) => branches.is_empty(),
            Branches::Resolved( ref branches ) | Branches::Frozen( ref branches ) => branches.is_empty()
        }
    }

    fn raw( &self ) -> Option< &BTreeMap< Address, Count > > {
        match *self {
            Branches::Raw( ref branches ) => Some( branches ),
            _ => None
        }
    }

    fn resolved( &self ) -> Option< &BTreeMap< SymbolRef, Count > > {
        match *self {
            Branches::Raw( _ ) => None,
            Branches::Resolved( ref branches ) | Branches::Frozen( ref branches ) => Some( branches )
        }
    }
}

/// Costs accumulated for a single sampled instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntryData {
    count: Count,
    branches: Branches,
    source: Option< SourcePosition >,
    symbol: Option< u32 >
}

impl EntryData {
    fn new() -> Self {
        EntryData {
            count: 0,
            branches: Branches::new(),
            source: None,
            symbol: None
        }
    }

    #[inline]
    pub fn count( &self ) -> Count {
        self.count
    }

    #[inline]
    pub fn source( &self ) -> Option< SourcePosition > {
        self.source
    }

    /// Index of the symbol containing this entry, within the owning
    /// object's symbol table. Filled during resolution.
    #[inline]
    pub fn symbol( &self ) -> Option< u32 > {
        self.symbol
    }

    /// The branch map after fixup; `None` while the branches are still
    /// keyed by raw addresses.
    #[inline]
    pub fn resolved_branches( &self ) -> Option< &BTreeMap< SymbolRef, Count > > {
        self.branches.resolved()
    }
}

/// A symbol from an object's resolved symbol table. The display name is
/// already demangled and suffixed; synthetic gap fillers have an empty
/// name and get their `func_<address>` spelling at emission time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SymbolData {
    pub(crate) name: String,
    pub(crate) source: Option< SourcePosition >,
    pub(crate) is_plt: bool
}

impl SymbolData {
    pub(crate) fn new( name: String, is_plt: bool ) -> Self {
        SymbolData {
            name,
            source: None,
            is_plt
        }
    }

    #[inline]
    pub fn name( &self ) -> &str {
        &self.name
    }

    #[inline]
    pub fn source( &self ) -> Option< SourcePosition > {
        self.source
    }

    #[inline]
    pub fn is_plt( &self ) -> bool {
        self.is_plt
    }
}

pub struct MemoryObjectData {
    file_name: String,
    page_offset: u64,
    uses_absolute_addresses: bool,
    entries: BTreeMap< Address, EntryData >,
    symbols: Vec< (Range< Address >, SymbolData) >
}

impl MemoryObjectData {
    fn new( file_name: String, page_offset: u64 ) -> Self {
        MemoryObjectData {
            file_name,
            page_offset,
            uses_absolute_addresses: false,
            entries: BTreeMap::new(),
            symbols: Vec::new()
        }
    }

    #[inline]
    pub fn file_name( &self ) -> &str {
        &self.file_name
    }

    #[inline]
    pub fn page_offset( &self ) -> u64 {
        self.page_offset
    }

    #[inline]
    pub fn uses_absolute_addresses( &self ) -> bool {
        self.uses_absolute_addresses
    }

    #[inline]
    pub fn entries( &self ) -> &BTreeMap< Address, EntryData > {
        &self.entries
    }

    /// The object's symbol table in ELF address space, sorted, pairwise
    /// non-overlapping, covering the executable span after resolution.
    #[inline]
    pub fn symbols( &self ) -> &[(Range< Address >, SymbolData)] {
        &self.symbols
    }

    /// Translates a process address into the object's ELF address space.
    /// `start` is the address at which the object was mapped.
    #[inline]
    pub fn map_to_elf( &self, start: Address, address: Address ) -> Address {
        if self.uses_absolute_addresses {
            address
        } else {
            address - start + self.page_offset
        }
    }

    /// The inverse of `map_to_elf`.
    #[inline]
    pub fn map_from_elf( &self, start: Address, address: Address ) -> Address {
        if self.uses_absolute_addresses {
            address
        } else {
            address + start - self.page_offset
        }
    }

    /// Finds the symbol containing the given ELF-space address.
    pub fn lookup_symbol( &self, elf_address: Address ) -> Option< u32 > {
        let index = self.symbols.partition_point( |&(ref range, _)| range.start <= elf_address );
        if index == 0 {
            return None;
        }

        let index = index - 1;
        if elf_address < self.symbols[ index ].0.end {
            Some( index as u32 )
        } else {
            None
        }
    }

    fn append_entry( &mut self, address: Address, count: Count ) -> &mut EntryData {
        let entry = self.entries.entry( address ).or_insert_with( EntryData::new );
        entry.count += count;
        entry
    }

    fn append_branch( &mut self, from: Address, to: Address ) {
        self.append_entry( from, 0 ).branches.add_raw( to );
    }

    fn resolve_entries(
        &mut self,
        mut resolver: AddressResolver,
        start: Address,
        interner: &mut StringInterner,
        details: DetailLevel
    ) {
        self.uses_absolute_addresses = resolver.uses_absolute_addresses();
        self.symbols = resolver.take_symbols();

        let entries = mem::replace( &mut self.entries, BTreeMap::new() );
        let mut used_symbols = Vec::new();
        for (address, mut entry) in entries {
            let elf_address = self.map_to_elf( start, address );
            let symbol = match self.lookup_symbol( elf_address ) {
                Some( symbol ) => symbol,
                None => {
                    debug!( "Can't resolve a symbol for address 0x{:016X} in {}; the entry will be dropped", elf_address, self.file_name );
                    continue;
                }
            };

            entry.symbol = Some( symbol );
            if details == DetailLevel::Sources {
                entry.source = resolver.source_position( elf_address ).map( |(file, line)| {
                    SourcePosition { file: interner.get_or_intern( file ), line }
                });
            }

            used_symbols.push( symbol );
            self.entries.insert( address, entry );
        }

        if details == DetailLevel::Sources {
            used_symbols.sort();
            used_symbols.dedup();
            for symbol in used_symbols {
                let &mut (ref range, ref mut data) = &mut self.symbols[ symbol as usize ];
                data.source = resolver.source_position( range.start ).map( |(file, line)| {
                    SourcePosition { file: interner.get_or_intern( file ), line }
                });
            }
        }
    }
}

pub struct Profile {
    mode: Mode,
    memory_objects: RangeMap< MemoryObjectData >,
    interner: StringInterner,
    mmap_event_count: u64,
    good_samples: u64,
    non_user_samples: u64,
    unmapped_samples: u64
}

impl Profile {
    pub fn new( mode: Mode ) -> Self {
        Profile {
            mode,
            memory_objects: RangeMap::new(),
            interner: StringInterner::new(),
            mmap_event_count: 0,
            good_samples: 0,
            non_user_samples: 0,
            unmapped_samples: 0
        }
    }

    /// Runs S1 + S2: drains the whole record stream and drops memory
    /// objects which didn't receive any samples.
    pub fn load< T: Read >( fp: T, mode: Mode ) -> io::Result< Self > {
        let mut profile = Profile::new( mode );
        for record in parse_records( fp ) {
            profile.process( record? );
        }

        profile.cleanup_memory_objects();
        Ok( profile )
    }

    pub fn process( &mut self, record: Record ) {
        match record {
            Record::Mmap( mmap ) => self.process_mmap( mmap ),
            Record::Sample( sample ) => self.process_sample( sample ),
            Record::Other { .. } => {}
        }
    }

    fn process_mmap( &mut self, mmap: MmapRecord ) {
        self.mmap_event_count += 1;
        if mmap.length == 0 {
            debug!( "Ignoring an empty mapping of {} at 0x{:016X}", mmap.file_name, mmap.address );
            return;
        }

        let range = mmap.address..mmap.address + mmap.length;
        let object = MemoryObjectData::new( mmap.file_name, mmap.page_offset );
        if let Err( (index, rejected) ) = self.memory_objects.push( range.clone(), object ) {
            let (existing_range, existing) = self.memory_objects.get_by_index( index ).unwrap();
            debug!(
                "Mapping of {} at 0x{:016X}-0x{:016X} overlaps {} at 0x{:016X}-0x{:016X}; dropped",
                rejected.file_name(),
                range.start, range.end,
                existing.file_name(),
                existing_range.start, existing_range.end
            );
        }
    }

    fn process_sample( &mut self, sample: SampleRecord ) {
        if sample.callchain.len() < 2 || sample.callchain[ 0 ] != PERF_CONTEXT_USER {
            // Callchain which starts outside of user space.
            self.non_user_samples += 1;
            return;
        }

        let index = match self.memory_objects.get_index( sample.ip ) {
            Some( index ) => index,
            None => {
                // The instruction pointer doesn't point into any mapped object.
                self.unmapped_samples += 1;
                return;
            }
        };

        self.memory_objects.get_by_index_mut( index ).unwrap().1.append_entry( sample.ip, 1 );
        self.good_samples += 1;

        if self.mode != Mode::CallGraph {
            return;
        }

        let mut skip_frame = false;
        let mut call_to = sample.ip;
        for &call_from in sample.callchain.iter().take( MAX_STACK_DEPTH ).skip( 2 ) {
            if call_from > PERF_CONTEXT_MAX {
                // Context switch marker; everything up to the next user
                // marker belongs to another privilege level.
                skip_frame = call_from != PERF_CONTEXT_USER;
                continue;
            }

            if skip_frame || call_from == call_to {
                continue;
            }

            let index = match self.memory_objects.get_index( call_from ) {
                Some( index ) => index,
                None => {
                    // Frame-pointer based unwinding; code built with
                    // -fomit-frame-pointer leaves garbage in the chain.
                    continue;
                }
            };

            self.memory_objects.get_by_index_mut( index ).unwrap().1.append_branch( call_from, call_to );
            call_to = call_from;
        }
    }

    fn cleanup_memory_objects( &mut self ) {
        self.memory_objects.retain( |object| !object.entries.is_empty() );
    }

    /// Runs S3 and, in call graph mode, the branch fixup of S4: builds a
    /// symbol table for every surviving object, annotates entries and
    /// rewrites raw branch targets into symbol references.
    pub fn resolve_and_fixup( &mut self, details: DetailLevel ) {
        for index in 0..self.memory_objects.len() {
            let (range, object) = self.memory_objects.get_by_index_mut( index ).unwrap();
            let fallback_end = object.page_offset + (range.end - range.start);
            let resolver = AddressResolver::new( details, &object.file_name, fallback_end );
            object.resolve_entries( resolver, range.start, &mut self.interner, details );
        }

        if self.mode == Mode::CallGraph {
            self.fixup_branches();
        }
    }

    /// Rewrites every raw callee address so that it refers to the
    /// callee's symbol; self recursion is elided, entries which end up
    /// with no cost at all are dropped.
    pub(crate) fn fixup_branches( &mut self ) {
        for index in 0..self.memory_objects.len() {
            let mut fixed = Vec::new();
            {
                let (_, object) = self.memory_objects.get_by_index( index ).unwrap();
                for (&address, entry) in &object.entries {
                    let raw = match entry.branches.raw() {
                        Some( raw ) => raw,
                        None => continue
                    };

                    let own_symbol = entry.symbol.map( |symbol| SymbolRef { object: index as u32, symbol } );
                    let mut resolved = BTreeMap::new();
                    for (&callee, &count) in raw {
                        match self.resolve_branch_target( callee ) {
                            Some( target ) => {
                                if Some( target ) == own_symbol {
                                    // Calls into the entry's own symbol
                                    // don't show up in the graph.
                                    continue;
                                }

                                *resolved.entry( target ).or_insert( 0 ) += count;
                            },
                            None => {
                                debug!( "Can't resolve a branch target at 0x{:016X}; the branch will be dropped", callee );
                            }
                        }
                    }

                    fixed.push( (address, resolved) );
                }
            }

            let (_, object) = self.memory_objects.get_by_index_mut( index ).unwrap();
            for (address, resolved) in fixed {
                object.entries.get_mut( &address ).unwrap().branches.resolve( resolved );
            }

            object.entries.retain( |_, entry| entry.count > 0 || !entry.branches.is_empty() );
            for entry in object.entries.values_mut() {
                entry.branches.freeze();
            }
        }
    }

    fn resolve_branch_target( &self, callee: Address ) -> Option< SymbolRef > {
        let object_index = self.memory_objects.get_index( callee )?;
        let (range, object) = self.memory_objects.get_by_index( object_index ).unwrap();
        let elf_address = object.map_to_elf( range.start, callee );
        let symbol = object.lookup_symbol( elf_address )?;

        Some( SymbolRef { object: object_index as u32, symbol } )
    }

    /// Looks up a resolved symbol reference.
    pub fn symbol( &self, reference: SymbolRef ) -> Option< (Range< Address >, &SymbolData, &MemoryObjectData) > {
        let object = self.memory_objects.get_value_by_index( reference.object as usize )?;
        let &(ref range, ref symbol) = object.symbols.get( reference.symbol as usize )?;
        Some( (range.clone(), symbol, object) )
    }

    #[inline]
    pub fn mode( &self ) -> Mode {
        self.mode
    }

    #[inline]
    pub fn memory_objects( &self ) -> &RangeMap< MemoryObjectData > {
        &self.memory_objects
    }

    #[inline]
    pub fn interner( &self ) -> &StringInterner {
        &self.interner
    }

    pub fn entry_count( &self ) -> u64 {
        self.memory_objects.values().map( |object| object.entries.len() as u64 ).sum()
    }

    #[inline]
    pub fn mmap_event_count( &self ) -> u64 {
        self.mmap_event_count
    }

    #[inline]
    pub fn good_samples_count( &self ) -> u64 {
        self.good_samples
    }

    #[inline]
    pub fn non_user_samples_count( &self ) -> u64 {
        self.non_user_samples
    }

    #[inline]
    pub fn unmapped_samples_count( &self ) -> u64 {
        self.unmapped_samples
    }
}
