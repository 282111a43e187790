use std::collections::BTreeMap;
use std::fmt;
use std::io;

use ahash::AHashMap as HashMap;

use crate::io_adapter::IoAdapter;
use crate::profile::{
    Address, Count, EntryData, MemoryObjectData, Profile, StringId, SymbolData, SymbolRef,
};
use crate::resolver::DetailLevel;

/*
    The emitted subset of the callgrind format:
      Header:
        positions: [instr] line
        events: Cycles
      Per memory object:
        ob=<absolute path of the object>
      Per function:
        fl=<source file>        (only when it changes)
        fn=<demangled name>
      Cost lines:
        [<0xaddr>] <line> <count>
      Call edges, attached to the caller's position:
        cob=<callee object>
        cfi=<callee source file>
        cfn=<callee function>
        calls=1 [<0xcallee_addr>] <callee_line>
        [<0xaddr>] <line> <count>
      fi=<file> switches the current file within one function.

    Objects are emitted in address order, functions in ELF address
    order, lines in ascending order and call edges in callee address
    order, so the output is byte-stable for a given input.
*/

#[derive(Default)]
struct LineCost {
    count: Count,
    branches: BTreeMap<SymbolRef, Count>,
}

fn file_display(profile: &Profile, file: Option<StringId>) -> &str {
    file.and_then(|id| profile.interner().resolve(id)).unwrap_or("???")
}

fn display_name(symbol: &SymbolData, start: Address) -> String {
    if symbol.name().is_empty() {
        format!("func_{:x}", start)
    } else {
        symbol.name().to_owned()
    }
}

pub struct CallgrindExporter<'a, T: fmt::Write> {
    tx: T,
    profile: &'a Profile,
    dump_instructions: bool,
    objects_only: bool,
    current_file: Option<Option<StringId>>,
}

impl<'a, T: fmt::Write> CallgrindExporter<'a, T> {
    fn dump(&mut self) -> fmt::Result {
        write!(self.tx, "positions:")?;
        if self.dump_instructions {
            write!(self.tx, " instr")?;
        }
        writeln!(self.tx, " line")?;
        writeln!(self.tx, "events: Cycles")?;
        writeln!(self.tx)?;

        for index in 0..self.profile.memory_objects().len() {
            self.dump_object(index)?;
            writeln!(self.tx)?;
        }

        Ok(())
    }

    fn dump_object(&mut self, object_index: usize) -> fmt::Result {
        let profile = self.profile;
        let (range, object) = profile.memory_objects().get_by_index(object_index).unwrap();
        writeln!(self.tx, "ob={}", object.file_name())?;
        self.current_file = None;

        // Group the entries by their containing symbol; the addresses
        // ascend, so the symbol indices do too.
        let mut groups: Vec<(u32, Vec<(Address, &EntryData)>)> = Vec::new();
        for (&address, entry) in object.entries() {
            let symbol = match entry.symbol() {
                Some(symbol) => symbol,
                None => continue,
            };

            match groups.last_mut() {
                Some(&mut (last, ref mut entries)) if last == symbol => {
                    entries.push((address, entry))
                }
                _ => groups.push((symbol, vec![(address, entry)])),
            }
        }

        for (symbol_index, entries) in groups {
            self.dump_symbol(range.start, object, symbol_index, &entries)?;
        }

        Ok(())
    }

    fn dump_symbol(
        &mut self,
        object_start: Address,
        object: &'a MemoryObjectData,
        symbol_index: u32,
        entries: &[(Address, &'a EntryData)],
    ) -> fmt::Result {
        let &(ref symbol_range, ref symbol) = &object.symbols()[symbol_index as usize];
        let primary_file = symbol.source().map(|position| position.file);

        if !self.objects_only && self.current_file != Some(primary_file) {
            let name = file_display(self.profile, primary_file);
            writeln!(self.tx, "fl={}", name)?;
            self.current_file = Some(primary_file);
        }

        writeln!(self.tx, "fn={}", display_name(symbol, symbol_range.start))?;

        if self.dump_instructions {
            self.dump_symbol_instructions(object_start, object, entries)
        } else {
            self.dump_symbol_lines(primary_file, entries)
        }
    }

    /// The default, line level dump: all entries of a symbol are summed
    /// up per (source file, line), the symbol's own file first.
    fn dump_symbol_lines(
        &mut self,
        primary_file: Option<StringId>,
        entries: &[(Address, &'a EntryData)],
    ) -> fmt::Result {
        let profile = self.profile;

        let mut by_file: HashMap<Option<StringId>, BTreeMap<u32, LineCost>> = HashMap::new();
        for &(_, entry) in entries {
            let (file, line) = match entry.source() {
                Some(position) => (Some(position.file), position.line),
                None => (None, 0),
            };

            let cost = by_file.entry(file).or_default().entry(line).or_default();
            cost.count += entry.count();
            if let Some(branches) = entry.resolved_branches() {
                for (&callee, &count) in branches {
                    *cost.branches.entry(callee).or_insert(0) += count;
                }
            }
        }

        if let Some(lines) = by_file.remove(&primary_file) {
            self.dump_lines(&lines)?;
        }

        let mut rest: Vec<_> = by_file.into_iter().collect();
        rest.sort_by(|a, b| file_display(profile, a.0).cmp(file_display(profile, b.0)));

        for (file, lines) in rest {
            if !self.objects_only {
                let name = file_display(self.profile, file);
                writeln!(self.tx, "fi={}", name)?;
                self.current_file = Some(file);
            }

            self.dump_lines(&lines)?;
        }

        Ok(())
    }

    fn dump_lines(&mut self, lines: &BTreeMap<u32, LineCost>) -> fmt::Result {
        for (&line, cost) in lines {
            if cost.count != 0 {
                writeln!(self.tx, "{} {}", line, cost.count)?;
            }

            for (&callee, &count) in &cost.branches {
                self.dump_call(callee, None, line, count)?;
            }
        }

        Ok(())
    }

    /// The `-i` dump: one cost line per sampled instruction, with the
    /// address given in the object's ELF address space.
    fn dump_symbol_instructions(
        &mut self,
        object_start: Address,
        object: &'a MemoryObjectData,
        entries: &[(Address, &'a EntryData)],
    ) -> fmt::Result {
        for &(address, entry) in entries {
            let elf_address = object.map_to_elf(object_start, address);
            let (file, line) = match entry.source() {
                Some(position) => (Some(position.file), position.line),
                None => (None, 0),
            };

            if !self.objects_only && self.current_file != Some(file) {
                let name = file_display(self.profile, file);
                writeln!(self.tx, "fi={}", name)?;
                self.current_file = Some(file);
            }

            if entry.count() != 0 {
                writeln!(self.tx, "0x{:x} {} {}", elf_address, line, entry.count())?;
            }

            if let Some(branches) = entry.resolved_branches() {
                for (&callee, &count) in branches {
                    self.dump_call(callee, Some(elf_address), line, count)?;
                }
            }
        }

        Ok(())
    }

    fn dump_call(
        &mut self,
        callee: SymbolRef,
        caller_address: Option<Address>,
        caller_line: u32,
        count: Count,
    ) -> fmt::Result {
        let profile = self.profile;
        // The reference was produced by the fixup, so it must be valid.
        let (callee_range, callee_symbol, callee_object) = profile.symbol(callee).unwrap();

        writeln!(self.tx, "cob={}", callee_object.file_name())?;
        let callee_file = callee_symbol.source().map(|position| position.file);
        writeln!(self.tx, "cfi={}", file_display(profile, callee_file))?;
        writeln!(self.tx, "cfn={}", display_name(callee_symbol, callee_range.start))?;

        let callee_line = callee_symbol.source().map(|position| position.line).unwrap_or(0);
        match caller_address {
            Some(address) => {
                writeln!(self.tx, "calls=1 0x{:x} {}", callee_range.start, callee_line)?;
                writeln!(self.tx, "0x{:x} {} {}", address, caller_line, count)?;
            }
            None => {
                writeln!(self.tx, "calls=1 {}", callee_line)?;
                writeln!(self.tx, "{} {}", caller_line, count)?;
            }
        }

        Ok(())
    }
}

fn io_err<T: fmt::Display>(err: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("failed to write the profile: {}", err))
}

pub fn export_as_callgrind<T: io::Write>(
    profile: &Profile,
    output: T,
    details: DetailLevel,
    dump_instructions: bool,
) -> io::Result<()> {
    let mut exporter = CallgrindExporter {
        tx: IoAdapter::new(output),
        profile,
        dump_instructions,
        objects_only: details == DetailLevel::Objects,
        current_file: None,
    };

    exporter.dump().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::export_as_callgrind;
    use crate::profile::{Mode, Profile};
    use crate::resolver::DetailLevel;
    use common::event::{MmapRecord, Record, SampleRecord, PERF_CONTEXT_USER};

    fn mmap(address: u64, length: u64, file_name: &str) -> Record {
        Record::Mmap(MmapRecord {
            pid: 1,
            tid: 1,
            address,
            length,
            page_offset: 0,
            file_name: file_name.to_owned(),
        })
    }

    fn sample(ip: u64, callchain: &[u64]) -> Record {
        Record::Sample(SampleRecord {
            ip,
            callchain: callchain.to_vec(),
        })
    }

    fn export(profile: &Profile, details: DetailLevel, dump_instructions: bool) -> String {
        let mut output = Vec::new();
        export_as_callgrind(profile, &mut output, details, dump_instructions).unwrap();
        String::from_utf8(output).unwrap()
    }

    // The object files intentionally don't exist, so the resolver covers
    // each object with a single synthetic symbol and the output is fully
    // deterministic.

    #[test]
    fn flat_objects_dump() {
        let mut profile = Profile::new(Mode::Flat);
        profile.process(mmap(0x400000, 0x1000, "/nonexistent/true"));
        profile.process(sample(0x400500, &[PERF_CONTEXT_USER, 0x400500]));
        profile.resolve_and_fixup(DetailLevel::Objects);

        let output = export(&profile, DetailLevel::Objects, false);
        assert_eq!(
            output,
            "positions: line\n\
             events: Cycles\n\
             \n\
             ob=/nonexistent/true\n\
             fn=whole@true\n\
             0 1\n\
             \n"
        );
    }

    #[test]
    fn call_graph_line_dump() {
        let mut profile = Profile::new(Mode::CallGraph);
        profile.process(mmap(0x400000, 0x1000, "/nonexistent/a.out"));
        profile.process(mmap(0x500000, 0x1000, "/nonexistent/libfoo.so"));
        profile.process(sample(0x500100, &[PERF_CONTEXT_USER, 0x500100, 0x400800]));
        profile.resolve_and_fixup(DetailLevel::Symbols);

        let output = export(&profile, DetailLevel::Symbols, false);
        assert_eq!(
            output,
            "positions: line\n\
             events: Cycles\n\
             \n\
             ob=/nonexistent/a.out\n\
             fl=???\n\
             fn=func_0\n\
             cob=/nonexistent/libfoo.so\n\
             cfi=???\n\
             cfn=func_0\n\
             calls=1 0\n\
             0 1\n\
             \n\
             ob=/nonexistent/libfoo.so\n\
             fl=???\n\
             fn=func_0\n\
             0 1\n\
             \n"
        );
    }

    #[test]
    fn call_graph_instruction_dump() {
        let mut profile = Profile::new(Mode::CallGraph);
        profile.process(mmap(0x400000, 0x1000, "/nonexistent/a.out"));
        profile.process(mmap(0x500000, 0x1000, "/nonexistent/libfoo.so"));
        profile.process(sample(0x500100, &[PERF_CONTEXT_USER, 0x500100, 0x400800]));
        profile.resolve_and_fixup(DetailLevel::Symbols);

        let output = export(&profile, DetailLevel::Symbols, true);
        assert_eq!(
            output,
            "positions: instr line\n\
             events: Cycles\n\
             \n\
             ob=/nonexistent/a.out\n\
             fl=???\n\
             fn=func_0\n\
             cob=/nonexistent/libfoo.so\n\
             cfi=???\n\
             cfn=func_0\n\
             calls=1 0x0 0\n\
             0x800 0 1\n\
             \n\
             ob=/nonexistent/libfoo.so\n\
             fl=???\n\
             fn=func_0\n\
             0x100 0 1\n\
             \n"
        );
    }

    #[test]
    fn exclusive_costs_on_the_same_line_are_summed() {
        let mut profile = Profile::new(Mode::Flat);
        profile.process(mmap(0x400000, 0x1000, "/nonexistent/true"));
        profile.process(sample(0x400500, &[PERF_CONTEXT_USER, 0x400500]));
        profile.process(sample(0x400508, &[PERF_CONTEXT_USER, 0x400508]));
        profile.process(sample(0x400500, &[PERF_CONTEXT_USER, 0x400500]));
        profile.resolve_and_fixup(DetailLevel::Symbols);

        let output = export(&profile, DetailLevel::Symbols, false);
        // Without source information everything lands on line 0.
        assert_eq!(
            output,
            "positions: line\n\
             events: Cycles\n\
             \n\
             ob=/nonexistent/true\n\
             fl=???\n\
             fn=func_0\n\
             0 3\n\
             \n"
        );
    }

    #[test]
    fn output_is_deterministic() {
        let mut profile = Profile::new(Mode::CallGraph);
        profile.process(mmap(0x400000, 0x1000, "/nonexistent/a.out"));
        profile.process(mmap(0x500000, 0x1000, "/nonexistent/libfoo.so"));
        profile.process(sample(0x500100, &[PERF_CONTEXT_USER, 0x500100, 0x400800]));
        profile.process(sample(0x400900, &[PERF_CONTEXT_USER, 0x400900, 0x500200]));
        profile.resolve_and_fixup(DetailLevel::Symbols);

        let first = export(&profile, DetailLevel::Symbols, false);
        let second = export(&profile, DetailLevel::Symbols, false);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
