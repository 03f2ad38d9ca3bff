use std::path::PathBuf;

use clap::Parser;

use saveset::label::{parse_label, LABEL_SIZE};
use saveset::tape::{open_tape, RecordOutcome, TapeFlavor, MAX_RECORD};

/// Dump the physical record structure of a tape image: one line per record,
/// with labels decoded and tape marks called out.
#[derive(Parser)]
#[command(name = "tape-info", about = "Inspect the record structure of a tape image")]
struct Args {
    /// Input tape image
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Input tape image (positional)
    #[arg(conflicts_with = "file", required_unless_present_any = ["file", "version"])]
    input: Option<PathBuf>,

    /// Input is a SIMH-format .tap image
    #[arg(short = 'I', long)]
    simh: bool,

    /// Stop after this many records (0 = no limit)
    #[arg(short = 'l', long, default_value_t = 0)]
    limit: u64,

    /// Display version and quit
    #[arg(long)]
    version: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reset SIGPIPE to default so piped output (e.g. head/tail) exits cleanly
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let args = Args::parse();

    if args.version {
        saveset::version::print_version(
            "tape-info",
            env!("CARGO_PKG_VERSION"),
            env!("RELEASE_VERSION"),
            env!("GIT_COMMIT"),
        );
        return Ok(());
    }

    let file = args.file.or(args.input).expect("file argument required");
    let flavor = if args.simh {
        TapeFlavor::Simh
    } else {
        TapeFlavor::Simple
    };
    let mut tape = open_tape(&file, flavor)?;

    let mut buf = vec![0u8; MAX_RECORD];
    let mut records: u64 = 0;
    let mut marks: u64 = 0;
    let mut bytes: u64 = 0;
    let mut files: u64 = 0;

    loop {
        let offset = tape.offset();
        match tape.next_record(&mut buf) {
            Ok(RecordOutcome::Record(len)) => {
                records += 1;
                bytes += len as u64;
                if len == LABEL_SIZE {
                    if let Some(label) = parse_label(&buf[..LABEL_SIZE]) {
                        println!("{offset:>12}  {len:>6}  {label:?}");
                        continue;
                    }
                }
                println!("{offset:>12}  {len:>6}  data");
            }
            Ok(RecordOutcome::TapeMark) => {
                marks += 1;
                println!("{offset:>12}       0  -- tape mark --");
                if tape.at_end() {
                    println!("{:>12}          -- end of tape --", tape.offset());
                    break;
                }
                // A tape file is whatever sits between two marks.
                files += 1;
            }
            Ok(RecordOutcome::EndOfTape) => {
                println!("{offset:>12}          -- end of medium --");
                break;
            }
            Err(e) => {
                eprintln!("error at offset {offset}: {e}");
                break;
            }
        }
        if args.limit != 0 && records >= args.limit {
            println!("(stopped after {} records)", records);
            break;
        }
    }

    println!();
    println!(
        "{} records ({} bytes) in {} tape files, {} tape marks",
        records, bytes, files, marks
    );
    Ok(())
}
