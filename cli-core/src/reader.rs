use std::io::{self, Read};

use common::event::{Record, RecordHeader};

/// Turns a raw byte stream into a lazy sequence of records.
///
/// A clean EOF right at a record boundary ends the stream; running out of
/// bytes in the middle of a header or payload is an error. After the first
/// error the iterator is done.
pub struct Iter< T: Read > {
    fp: T,
    buffer: Vec< u8 >,
    done: bool
}

impl< T > Iterator for Iter< T > where T: Read {
    type Item = io::Result< Record >;

    fn next( &mut self ) -> Option< Self::Item > {
        if self.done {
            return None;
        }

        match self.read_record() {
            Ok( Some( record ) ) => Some( Ok( record ) ),
            Ok( None ) => {
                self.done = true;
                None
            },
            Err( err ) => {
                self.done = true;
                Some( Err( err ) )
            }
        }
    }
}

impl< T > Iter< T > where T: Read {
    fn read_record( &mut self ) -> io::Result< Option< Record > > {
        let mut header_bytes = [0; RecordHeader::SIZE];
        if !read_exact_or_eof( &mut self.fp, &mut header_bytes )? {
            return Ok( None );
        }

        let header = RecordHeader::parse( &header_bytes );
        let payload_size = header.payload_size()?;

        self.buffer.resize( payload_size, 0 );
        self.fp.read_exact( &mut self.buffer ).map_err( |err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new( io::ErrorKind::UnexpectedEof, format!( "record of type {} is truncated", header.kind ) )
            } else {
                err
            }
        })?;

        Record::parse( &header, &self.buffer ).map( Some )
    }
}

/// Reads as many bytes as the buffer holds; `Ok( false )` means the stream
/// ended before the first byte.
fn read_exact_or_eof< T: Read >( fp: &mut T, buffer: &mut [u8] ) -> io::Result< bool > {
    let mut filled = 0;
    while filled < buffer.len() {
        match fp.read( &mut buffer[ filled.. ] ) {
            Ok( 0 ) => {
                if filled == 0 {
                    return Ok( false );
                }

                return Err( io::Error::new( io::ErrorKind::UnexpectedEof, "truncated record header" ) );
            },
            Ok( count ) => filled += count,
            Err( ref err ) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err( err ) => return Err( err )
        }
    }

    Ok( true )
}

pub fn parse_records< T >( fp: T ) -> Iter< T > where T: Read {
    Iter {
        fp,
        buffer: Vec::new(),
        done: false
    }
}

#[cfg(test)]
mod tests {
    use super::parse_records;
    use byteorder::{NativeEndian, WriteBytesExt};
    use common::event::{Record, PERF_CONTEXT_USER, PERF_RECORD_SAMPLE};
    use std::io;

    fn sample_record( ip: u64, callchain: &[u64] ) -> Vec< u8 > {
        let mut out = Vec::new();
        out.write_u32::< NativeEndian >( PERF_RECORD_SAMPLE ).unwrap();
        out.write_u16::< NativeEndian >( 0 ).unwrap();
        out.write_u16::< NativeEndian >( (8 + 16 + callchain.len() * 8) as u16 ).unwrap();
        out.write_u64::< NativeEndian >( ip ).unwrap();
        out.write_u64::< NativeEndian >( callchain.len() as u64 ).unwrap();
        for &frame in callchain {
            out.write_u64::< NativeEndian >( frame ).unwrap();
        }
        out
    }

    fn unknown_record( kind: u32, payload: &[u8] ) -> Vec< u8 > {
        let mut out = Vec::new();
        out.write_u32::< NativeEndian >( kind ).unwrap();
        out.write_u16::< NativeEndian >( 0 ).unwrap();
        out.write_u16::< NativeEndian >( (8 + payload.len()) as u16 ).unwrap();
        out.extend_from_slice( payload );
        out
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let records: Vec< _ > = parse_records( io::Cursor::new( Vec::new() ) ).collect();
        assert!( records.is_empty() );
    }

    #[test]
    fn records_are_yielded_in_order() {
        let mut stream = Vec::new();
        stream.extend( unknown_record( 3, &[0; 16] ) );
        stream.extend( sample_record( 0x400500, &[ PERF_CONTEXT_USER, 0x400500 ] ) );

        let records: Vec< _ > = parse_records( io::Cursor::new( stream ) )
            .collect::< io::Result< Vec< _ > > >()
            .unwrap();

        assert_eq!( records.len(), 2 );
        assert_eq!( records[ 0 ], Record::Other { kind: 3 } );
        match &records[ 1 ] {
            Record::Sample( sample ) => assert_eq!( sample.ip, 0x400500 ),
            _ => panic!()
        }
    }

    #[test]
    fn truncated_header_is_an_error() {
        let stream = vec![ 0x09, 0x00, 0x00 ];
        let mut iter = parse_records( io::Cursor::new( stream ) );
        assert!( iter.next().unwrap().is_err() );
        assert!( iter.next().is_none() );
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut stream = sample_record( 0x400500, &[ PERF_CONTEXT_USER, 0x400500 ] );
        stream.truncate( stream.len() - 4 );

        let mut iter = parse_records( io::Cursor::new( stream ) );
        let error = iter.next().unwrap().unwrap_err();
        assert_eq!( error.kind(), io::ErrorKind::UnexpectedEof );
        assert!( iter.next().is_none() );
    }
}
