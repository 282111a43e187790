#[macro_use]
extern crate log;

use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use cli_core::{
    export_as_callgrind,
    DetailLevel,
    Mode,
    Profile
};

#[derive(StructOpt, Debug)]
enum Opt {
    /// Prints basic statistics about a data file
    #[structopt(name = "info")]
    Info {
        /// Either 'flat' or 'callgraph'
        #[structopt(parse(try_from_str))]
        mode: Mode,
        #[structopt(parse(from_os_str))]
        input: PathBuf
    },
    /// Converts a data file into a callgrind compatible profile
    #[structopt(name = "convert")]
    Convert {
        /// Either 'flat' or 'callgraph'
        #[structopt(short = "m", long = "mode", default_value = "callgraph", parse(try_from_str))]
        mode: Mode,
        /// Either 'object', 'symbol' or 'source'
        #[structopt(short = "d", long = "details", default_value = "source", parse(try_from_str))]
        details: DetailLevel,
        /// Dumps costs per instruction instead of per source line
        #[structopt(short = "i", long = "instructions")]
        dump_instructions: bool,
        #[structopt(parse(from_os_str))]
        input: PathBuf,
        /// The standard output is used when not given
        #[structopt(parse(from_os_str))]
        output: Option< PathBuf >
    }
}

fn load( input: &PathBuf, mode: Mode ) -> Result< Profile, Box< dyn Error > > {
    let fp = File::open( input ).map_err( |err| format!( "cannot open {}: {}", input.display(), err ) )?;
    let profile = Profile::load( BufReader::new( fp ), mode )?;
    Ok( profile )
}

fn run( opt: Opt ) -> Result< (), Box< dyn Error > > {
    match opt {
        Opt::Info { mode, input } => {
            let profile = load( &input, mode )?;
            let samples = profile.good_samples_count()
                + profile.non_user_samples_count()
                + profile.unmapped_samples_count();

            println!( "memory objects: {}", profile.memory_objects().len() );
            println!( "entries: {}", profile.entry_count() );
            println!();
            println!( "mmap events: {}", profile.mmap_event_count() );
            println!( "good sample events: {}", profile.good_samples_count() );
            println!( "non-user sample events: {}", profile.non_user_samples_count() );
            println!( "unmapped sample events: {}", profile.unmapped_samples_count() );
            println!( "total sample events: {}", samples );
            println!( "total events: {}", samples + profile.mmap_event_count() );
        },
        Opt::Convert { mut mode, details, dump_instructions, input, output } => {
            if details == DetailLevel::Objects && mode == Mode::CallGraph {
                // Call graphs make no sense with whole objects only.
                mode = Mode::Flat;
            }

            let mut profile = load( &input, mode )?;
            profile.resolve_and_fixup( details );

            match output {
                Some( path ) => {
                    let data_out = File::create( &path ).map_err( |err| format!( "cannot create {}: {}", path.display(), err ) )?;
                    let data_out = BufWriter::new( data_out );
                    export_as_callgrind( &profile, data_out, details, dump_instructions )?;
                },
                None => {
                    let stdout = io::stdout();
                    export_as_callgrind( &profile, stdout.lock(), details, dump_instructions )?;
                }
            }
        }
    }

    Ok(())
}

fn main() {
    if env::var( "RUST_LOG" ).is_err() {
        env::set_var( "RUST_LOG", "info" );
    }

    env_logger::init();

    let opt = Opt::from_args();
    let result = run( opt );
    if let Err( error ) = result {
        error!( "{}", error );
        if !log_enabled!( log::Level::Error ) {
            eprintln!( "ERROR: {}", error );
        }

        process::exit( 1 );
    }
}
