use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use clap::{Parser, ValueEnum};

use saveset::driver::{DecodeMode, DecodeOptions, Decoder, NameFilter};
use saveset::label::SavesetSelector;
use saveset::output::{OutputOptions, VersionPolicy};
use saveset::report::DecodeReport;
use saveset::tape::{open_tape, TapeFlavor};
use saveset::vbn::VfcPolicy;

/// VMS BACKUP saveset lister/extractor.
#[derive(Parser)]
#[command(name = "vmsx", about = "List and extract files from VMS BACKUP savesets")]
struct Args {
    /// List saveset contents without extracting
    #[arg(short = 't', long)]
    list: bool,

    /// Extract files from the savesets
    #[arg(short = 'x', long)]
    extract: bool,

    /// Input tape device or image file
    #[arg(short = 'f', long = "file", default_value = "/dev/tape")]
    file: PathBuf,

    /// Input is a disk image of a tape (length-prefixed records)
    #[arg(short = 'i', long, conflicts_with = "simh")]
    image: bool,

    /// Input is a SIMH-format .tap image
    #[arg(short = 'I', long)]
    simh: bool,

    /// Select the saveset with this HDR1 name
    #[arg(short = 'n', long, conflicts_with_all = ["set_number", "ordinal"])]
    saveset: Option<String>,

    /// Select the saveset with this HDR1 sequence number
    #[arg(short = 's', long = "set-number", conflicts_with = "ordinal")]
    set_number: Option<u32>,

    /// Select the nth HDR1 label on the tape, counting from 1
    #[arg(short = 'S', long)]
    ordinal: Option<u32>,

    /// Reproduce the legacy directory structure during extraction
    #[arg(short = 'd', long)]
    directories: bool,

    /// Extract all files regardless of filetype
    #[arg(short = 'e', long)]
    all_types: bool,

    /// Strip version numbers, keep only the latest version of each file
    #[arg(short = 'R', long)]
    latest_only: bool,

    /// Delimiter between base name, version number, and tags
    #[arg(long, default_value_t = ';')]
    delimiter: char,

    /// VFC carriage-control handling
    #[arg(long, value_enum, default_value_t = VfcArg::Decode)]
    vfc: VfcArg,

    /// Do not keep recovery copies of VAR/VFC files
    #[arg(long)]
    no_recover: bool,

    /// Output directory
    #[arg(short = 'o', long = "output-folder", default_value = "./")]
    output_folder: PathBuf,

    /// Emit the full report as JSON
    #[arg(long)]
    json: bool,

    /// Print the JSON schema of the report format and exit
    #[arg(long)]
    schema: bool,

    /// Display version and quit
    #[arg(long)]
    version: bool,

    /// Filename patterns to select (glob syntax, matched against legacy
    /// names like `[DIR]NAME.TXT;1`)
    patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VfcArg {
    Discard,
    Decode,
    Keep,
}

impl From<VfcArg> for VfcPolicy {
    fn from(arg: VfcArg) -> VfcPolicy {
        match arg {
            VfcArg::Discard => VfcPolicy::Discard,
            VfcArg::Decode => VfcPolicy::Decode,
            VfcArg::Keep => VfcPolicy::Keep,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.version {
        saveset::version::print_version(
            "vmsx",
            env!("CARGO_PKG_VERSION"),
            env!("RELEASE_VERSION"),
            env!("GIT_COMMIT"),
        );
        return Ok(());
    }

    if args.schema {
        let schema = schemars::schema_for!(DecodeReport);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    if !args.list && !args.extract {
        return Err("must enable at least one of: --list (-t), --extract (-x)".into());
    }

    let flavor = if args.simh {
        TapeFlavor::Simh
    } else if args.image {
        TapeFlavor::Simple
    } else {
        TapeFlavor::Device
    };

    let tape = open_tape(&args.file, flavor)
        .map_err(|e| format!("error opening {}: {}", args.file.display(), e))?;

    let select = if let Some(name) = &args.saveset {
        SavesetSelector::Name(name.clone())
    } else if let Some(number) = args.set_number {
        SavesetSelector::Number(number)
    } else if let Some(ordinal) = args.ordinal {
        SavesetSelector::Ordinal(ordinal)
    } else {
        SavesetSelector::All
    };

    let mode = if args.extract {
        DecodeMode::Extract(OutputOptions {
            out_dir: args.output_folder.clone(),
            keep_directories: args.directories,
            delimiter: args.delimiter,
            versions: if args.latest_only {
                VersionPolicy::LatestOnly
            } else {
                VersionPolicy::Keep
            },
            all_types: args.all_types,
            recoverable: !args.no_recover,
            set_times: true,
        })
    } else {
        DecodeMode::List
    };

    let opts = DecodeOptions {
        mode,
        select,
        vfc: args.vfc.into(),
        filter: build_filter(&args.patterns)?,
    };

    let report = Decoder::new(tape, opts).run()?;

    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print_listing(&report, args.list);
    }

    // Decode errors are reported but do not change the exit status.
    Ok(())
}

/// Compile glob patterns into a name filter. Legacy filenames are upper
/// case, so matching ignores case.
fn build_filter(patterns: &[String]) -> Result<Option<NameFilter>, Box<dyn std::error::Error>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let compiled: Vec<glob::Pattern> = patterns
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad pattern: {}", e))?;
    let options = glob::MatchOptions {
        case_sensitive: false,
        ..glob::MatchOptions::new()
    };
    Ok(Some(Box::new(move |name: &str| {
        compiled.iter().any(|p| p.matches_with(name, options))
    })))
}

fn format_time(secs: Option<i64>) -> String {
    match secs.and_then(|s| Utc.timestamp_opt(s, 0).single()) {
        Some(dt) => dt.format("%d-%b-%Y %H:%M:%S").to_string(),
        None => "<none specified>".to_string(),
    }
}

fn print_listing(report: &DecodeReport, listing: bool) {
    for ss in &report.savesets {
        println!("Saveset: {:<20} number: {}", ss.name, ss.sequence);
        if let Some(summary) = &ss.summary {
            if let Some(cmd) = &summary.command_line {
                println!("  Command:    \"{}\"", cmd);
            }
            if let Some(user) = &summary.user {
                println!("  Written by: \"{}\"", user);
            }
            if let (Some(os), Some(ver)) = (summary.os_name(), &summary.os_version) {
                println!("  OS:         {} {}", os, ver);
            }
            if let Some(node) = &summary.node_name {
                println!("  Node:       \"{}\"", node);
            }
            if let Some(ver) = &summary.backup_version {
                println!("  Backup Ver: \"{}\"", ver);
            }
            if let (Some(blk), Some(grp), Some(buf)) =
                (summary.blocksize, summary.group_size, summary.buffer_count)
            {
                println!("  Blocksize:  {}  Groupsize: {}  Buffcount: {}", blk, grp, buf);
            }
        }
        if listing {
            for file in &ss.files {
                if !file.selected {
                    continue;
                }
                let mut flags = String::new();
                if file.errors.any() {
                    flags.push_str(" (ERRORS)");
                }
                if file.directory {
                    flags.push_str(" (dir)");
                }
                println!(
                    " {:<36} {:>9}  {:<6} {}{}",
                    file.name,
                    file.size,
                    file.format,
                    format_time(file.modified),
                    flags
                );
            }
        } else {
            for file in &ss.files {
                if let Some(path) = &file.extracted_to {
                    log::debug!("{} -> {}", file.name, path.display());
                }
            }
        }
        if ss.errors > 0 {
            println!("  {} error(s) in this saveset", ss.errors);
        }
        println!();
    }
    println!("End of tape");
    if report.total_errors > 0 {
        println!("A total of {} error(s) detected.", report.total_errors);
    }
}
