use std::io;

use byteorder::{ByteOrder, NativeEndian};

pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// Synthetic callchain markers; the kernel emits them as huge addresses
// near the top of the address space.
pub const PERF_CONTEXT_KERNEL: u64 = -128_i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512_i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095_i64 as u64;

// Matches PERF_MAX_STACK_DEPTH; deeper callchains are truncated, not rejected.
pub const MAX_STACK_DEPTH: usize = 127;

/// The fixed 8-byte header every record starts with.
///
/// `size` covers the header itself, so the payload is `size - 8` bytes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn parse( buffer: &[u8; Self::SIZE] ) -> Self {
        RecordHeader {
            kind: NativeEndian::read_u32( &buffer[ 0..4 ] ),
            misc: NativeEndian::read_u16( &buffer[ 4..6 ] ),
            size: NativeEndian::read_u16( &buffer[ 6..8 ] )
        }
    }

    pub fn payload_size( &self ) -> io::Result< usize > {
        let size = self.size as usize;
        if size < Self::SIZE {
            return Err( io::Error::new(
                io::ErrorKind::InvalidData,
                format!( "record of type {} declares a size of {} bytes, smaller than its own header", self.kind, size )
            ));
        }

        Ok( size - Self::SIZE )
    }
}

/// A new memory mapping in the profiled process.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MmapRecord {
    pub pid: u32,
    pub tid: u32,
    pub address: u64,
    pub length: u64,
    pub page_offset: u64,
    pub file_name: String
}

/// A single sample: an instruction pointer plus the kernel's
/// frame-pointer callchain, including its context markers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SampleRecord {
    pub ip: u64,
    pub callchain: Vec< u64 >
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Record {
    Mmap( MmapRecord ),
    Sample( SampleRecord ),
    Other { kind: u32 }
}

fn truncated( what: &str ) -> io::Error {
    io::Error::new( io::ErrorKind::InvalidData, format!( "truncated {} record", what ) )
}

impl Record {
    /// Parses a record payload. The payload must be exactly `size - 8`
    /// bytes long; the reader is responsible for the framing.
    pub fn parse( header: &RecordHeader, payload: &[u8] ) -> io::Result< Self > {
        match header.kind {
            PERF_RECORD_MMAP => parse_mmap( payload ).map( Record::Mmap ),
            PERF_RECORD_SAMPLE => parse_sample( payload ).map( Record::Sample ),
            kind => Ok( Record::Other { kind } )
        }
    }
}

fn parse_mmap( payload: &[u8] ) -> io::Result< MmapRecord > {
    if payload.len() < 32 {
        return Err( truncated( "mmap" ) );
    }

    let file_name = &payload[ 32.. ];
    // The collector NUL-terminates the path and pads it to an 8-byte boundary.
    let len = match file_name.iter().position( |&byte| byte == 0 ) {
        Some( len ) => len,
        None => return Err( io::Error::new( io::ErrorKind::InvalidData, "mmap record with an unterminated file name" ) )
    };

    Ok( MmapRecord {
        pid: NativeEndian::read_u32( &payload[ 0..4 ] ),
        tid: NativeEndian::read_u32( &payload[ 4..8 ] ),
        address: NativeEndian::read_u64( &payload[ 8..16 ] ),
        length: NativeEndian::read_u64( &payload[ 16..24 ] ),
        page_offset: NativeEndian::read_u64( &payload[ 24..32 ] ),
        file_name: String::from_utf8_lossy( &file_name[ ..len ] ).into_owned()
    })
}

fn parse_sample( payload: &[u8] ) -> io::Result< SampleRecord > {
    if payload.len() < 16 {
        return Err( truncated( "sample" ) );
    }

    let ip = NativeEndian::read_u64( &payload[ 0..8 ] );
    let callchain_size = NativeEndian::read_u64( &payload[ 8..16 ] ) as usize;
    let callchain_bytes = &payload[ 16.. ];
    if callchain_size.checked_mul( 8 ).map( |bytes| bytes > callchain_bytes.len() ).unwrap_or( true ) {
        return Err( io::Error::new( io::ErrorKind::InvalidData, "sample record with a callchain bigger than the record itself" ) );
    }

    let mut callchain = Vec::with_capacity( callchain_size );
    for chunk in callchain_bytes.chunks_exact( 8 ).take( callchain_size ) {
        callchain.push( NativeEndian::read_u64( chunk ) );
    }

    Ok( SampleRecord { ip, callchain } )
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn header_bytes( kind: u32, size: u16 ) -> [u8; 8] {
        let mut buffer = [0; 8];
        NativeEndian::write_u32( &mut buffer[ 0..4 ], kind );
        NativeEndian::write_u16( &mut buffer[ 4..6 ], 0 );
        NativeEndian::write_u16( &mut buffer[ 6..8 ], size );
        buffer
    }

    #[test]
    fn parse_header() {
        let header = RecordHeader::parse( &header_bytes( PERF_RECORD_SAMPLE, 40 ) );
        assert_eq!( header.kind, PERF_RECORD_SAMPLE );
        assert_eq!( header.size, 40 );
        assert_eq!( header.payload_size().unwrap(), 32 );
    }

    #[test]
    fn header_smaller_than_itself_is_an_error() {
        let header = RecordHeader::parse( &header_bytes( PERF_RECORD_MMAP, 4 ) );
        assert!( header.payload_size().is_err() );
    }

    #[test]
    fn parse_mmap_record() {
        let mut payload = Vec::new();
        payload.write_u32::< NativeEndian >( 1234 ).unwrap();
        payload.write_u32::< NativeEndian >( 1235 ).unwrap();
        payload.write_u64::< NativeEndian >( 0x400000 ).unwrap();
        payload.write_u64::< NativeEndian >( 0x1000 ).unwrap();
        payload.write_u64::< NativeEndian >( 0 ).unwrap();
        payload.extend_from_slice( b"/bin/true\0\0\0\0\0\0\0" );

        let header = RecordHeader { kind: PERF_RECORD_MMAP, misc: 0, size: (8 + payload.len()) as u16 };
        let record = Record::parse( &header, &payload ).unwrap();
        assert_eq!( record, Record::Mmap( MmapRecord {
            pid: 1234,
            tid: 1235,
            address: 0x400000,
            length: 0x1000,
            page_offset: 0,
            file_name: "/bin/true".to_owned()
        }));
    }

    #[test]
    fn parse_sample_record() {
        let mut payload = Vec::new();
        payload.write_u64::< NativeEndian >( 0x400500 ).unwrap();
        payload.write_u64::< NativeEndian >( 2 ).unwrap();
        payload.write_u64::< NativeEndian >( PERF_CONTEXT_USER ).unwrap();
        payload.write_u64::< NativeEndian >( 0x400500 ).unwrap();

        let header = RecordHeader { kind: PERF_RECORD_SAMPLE, misc: 0, size: (8 + payload.len()) as u16 };
        let record = Record::parse( &header, &payload ).unwrap();
        assert_eq!( record, Record::Sample( SampleRecord {
            ip: 0x400500,
            callchain: vec![ PERF_CONTEXT_USER, 0x400500 ]
        }));
    }

    #[test]
    fn sample_with_an_oversized_callchain_is_an_error() {
        let mut payload = Vec::new();
        payload.write_u64::< NativeEndian >( 0x400500 ).unwrap();
        payload.write_u64::< NativeEndian >( 100 ).unwrap();
        payload.write_u64::< NativeEndian >( PERF_CONTEXT_USER ).unwrap();

        let header = RecordHeader { kind: PERF_RECORD_SAMPLE, misc: 0, size: (8 + payload.len()) as u16 };
        assert!( Record::parse( &header, &payload ).is_err() );
    }

    #[test]
    fn unknown_records_are_passed_through() {
        let header = RecordHeader { kind: 17, misc: 0, size: 16 };
        let record = Record::parse( &header, &[0; 8] ).unwrap();
        assert_eq!( record, Record::Other { kind: 17 } );
    }
}
