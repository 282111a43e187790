#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod exporter_callgrind;
mod io_adapter;
mod profile;
mod reader;
mod resolver;
mod util;

pub use crate::exporter_callgrind::export_as_callgrind;
pub use crate::profile::{
    Address, Count, EntryData, MemoryObjectData, Mode, Profile, SourcePosition, StringId,
    StringInterner, SymbolData, SymbolRef,
};
pub use crate::reader::parse_records;
pub use crate::resolver::{AddressResolver, DetailLevel};
