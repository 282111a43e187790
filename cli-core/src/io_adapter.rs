use std::io;
use std::fmt;

/// Lets code written against `fmt::Write` target any `io::Write` sink.
pub struct IoAdapter< T >( T );

impl< T > IoAdapter< T > {
    #[inline]
    pub fn new( fp: T ) -> Self {
        IoAdapter( fp )
    }
}

impl< T: io::Write > fmt::Write for IoAdapter< T > {
    #[inline]
    fn write_str( &mut self, string: &str ) -> Result< (), fmt::Error > {
        self.0.write_all( string.as_bytes() ).map_err( |_| fmt::Error )
    }
}
