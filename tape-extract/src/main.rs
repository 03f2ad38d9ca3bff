use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::Parser;
use flate2::write::GzEncoder;
use flate2::Compression;

use saveset::label::{parse_label, Label, LABEL_SIZE};
use saveset::tape::{open_tape, RecordOutcome, TapeFlavor, MAX_RECORD};

/// Copy one saveset (labels, data blocks, and tape marks) out of a larger
/// tape image into a standalone image, so it can be decoded or archived on
/// its own.
#[derive(Parser)]
#[command(
    name = "tape-extract",
    about = "Copy a saveset from a tape image into a standalone image"
)]
struct Args {
    /// Select the saveset with this HDR1 name
    #[arg(short = 'n', long, conflicts_with = "ordinal")]
    saveset: Option<String>,

    /// Select the nth HDR1 label on the tape, counting from 1
    #[arg(short = 'S', long)]
    ordinal: Option<u32>,

    /// Input is a SIMH-format .tap image
    #[arg(short = 'I', long)]
    simh: bool,

    /// Display version and quit
    #[arg(long)]
    version: bool,

    /// Input tape image
    input: Option<PathBuf>,

    /// Output image (length-prefixed records; `.gz` compresses the output)
    output: Option<PathBuf>,
}

/// Output image writer, optionally gzip-compressed.
enum ImageWriter {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
}

impl ImageWriter {
    fn create(path: &PathBuf) -> io::Result<ImageWriter> {
        let file = BufWriter::new(File::create(path)?);
        if path.to_string_lossy().ends_with(".gz") {
            Ok(ImageWriter::Gz(GzEncoder::new(file, Compression::default())))
        } else {
            Ok(ImageWriter::Plain(file))
        }
    }

    fn write_record(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(&(data.len() as u32).to_le_bytes())?;
        self.write_all(data)
    }

    fn write_tape_mark(&mut self) -> io::Result<()> {
        self.write_all(&0u32.to_le_bytes())
    }

    fn finish(self) -> io::Result<()> {
        match self {
            ImageWriter::Plain(mut w) => w.flush(),
            ImageWriter::Gz(gz) => gz.finish().map(|mut w| w.flush())?,
        }
    }
}

impl Write for ImageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ImageWriter::Plain(w) => w.write(buf),
            ImageWriter::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ImageWriter::Plain(w) => w.flush(),
            ImageWriter::Gz(w) => w.flush(),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.version {
        saveset::version::print_version(
            "tape-extract",
            env!("CARGO_PKG_VERSION"),
            env!("RELEASE_VERSION"),
            env!("GIT_COMMIT"),
        );
        return Ok(());
    }

    let input = args.input.ok_or("INPUT is required unless --version is specified")?;
    let output = args.output.ok_or("OUTPUT is required")?;
    if args.saveset.is_none() && args.ordinal.is_none() {
        return Err("select a saveset with --saveset <name> or --ordinal <n>".into());
    }

    let flavor = if args.simh {
        TapeFlavor::Simh
    } else {
        TapeFlavor::Simple
    };
    let mut tape = open_tape(&input, flavor)
        .map_err(|e| format!("error opening {}: {}", input.display(), e))?;
    let mut out = ImageWriter::create(&output)
        .map_err(|e| format!("error creating {}: {}", output.display(), e))?;

    let mut buf = vec![0u8; MAX_RECORD];
    let mut num_headers: u32 = 0;
    let mut copying = false;
    let mut seen_eof = false;
    let mut records: u64 = 0;
    let mut bytes: u64 = 0;

    loop {
        match tape.next_record(&mut buf)? {
            RecordOutcome::Record(len) => {
                let label = if len == LABEL_SIZE {
                    parse_label(&buf[..LABEL_SIZE])
                } else {
                    None
                };
                if let Some(Label::Header1 { name, sequence }) = &label {
                    num_headers += 1;
                    let wanted = match (&args.saveset, args.ordinal) {
                        (Some(want), _) => want.trim_end() == name,
                        (None, Some(ordinal)) => num_headers == ordinal,
                        (None, None) => unreachable!("selection validated above"),
                    };
                    if wanted && !copying {
                        log::info!("copying saveset \"{}\" (number {})", name, sequence);
                        copying = true;
                    }
                }
                if copying {
                    if matches!(label, Some(Label::EndOfFile1) | Some(Label::EndOfFile2)) {
                        seen_eof = true;
                    }
                    out.write_record(&buf[..len])?;
                    records += 1;
                    bytes += len as u64;
                }
            }
            RecordOutcome::TapeMark => {
                if copying {
                    out.write_tape_mark()?;
                    if seen_eof {
                        // The saveset is complete; a second mark terminates
                        // the standalone image.
                        out.write_tape_mark()?;
                        break;
                    }
                }
                if tape.at_end() {
                    break;
                }
            }
            RecordOutcome::EndOfTape => break,
        }
    }

    if !copying {
        return Err("no matching saveset found".into());
    }
    out.finish()?;
    log::info!(
        "wrote {} records ({} bytes) to {}",
        records,
        bytes,
        output.display()
    );
    Ok(())
}
