//! Extraction output: filename conversion, the primary and alternate
//! streams, and close-time renames that flag damaged files.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::file::{FileErrors, FileMeta};

/// Filetypes that are pointless to extract to a host system (images,
/// libraries, dumps); compared on their first three characters.
pub const IGNORED_TYPES: &[&str] = &[
    "exe", "lib", "obj", "odl", "olb", "pmd", "stb", "sys", "tsk", "dir", "upd", "tlo", "tlb",
];

/// How legacy version numbers map onto host filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Keep every version, appending `<delimiter><version>` to the name.
    #[default]
    Keep,
    /// Strip the version; when consecutive files share a base name only the
    /// highest version is extracted. Filenames keep their original case.
    LatestOnly,
}

#[derive(Debug, Clone)]
pub struct OutputOptions {
    pub out_dir: PathBuf,
    /// Reproduce `[DIR.SUBDIR]` as host directories instead of flattening.
    pub keep_directories: bool,
    /// Separates base name from version and from error/format tags.
    pub delimiter: char,
    pub versions: VersionPolicy,
    /// Extract even the filetypes on `IGNORED_TYPES`.
    pub all_types: bool,
    /// Keep a byte-faithful alternate copy of VAR/VFC input so damaged
    /// files can be recovered.
    pub recoverable: bool,
    /// Apply the saveset's atime/mtime to extracted files.
    pub set_times: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            out_dir: PathBuf::from("."),
            keep_directories: false,
            delimiter: ';',
            versions: VersionPolicy::Keep,
            all_types: false,
            recoverable: true,
            set_times: true,
        }
    }
}

/// The open output streams of the file currently being extracted.
pub struct OutputFiles {
    primary: BufWriter<File>,
    alternate: Option<BufWriter<File>>,
    pub primary_path: PathBuf,
    pub alternate_path: Option<PathBuf>,
    alternate_bytes: u64,
}

impl OutputFiles {
    pub fn create(primary_path: PathBuf, alternate_path: Option<PathBuf>) -> io::Result<OutputFiles> {
        let primary = BufWriter::new(File::create(&primary_path)?);
        let alternate = match &alternate_path {
            Some(p) => Some(BufWriter::new(File::create(p)?)),
            None => None,
        };
        Ok(OutputFiles {
            primary,
            alternate,
            primary_path,
            alternate_path,
            alternate_bytes: 0,
        })
    }

    pub fn write_primary(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.primary.write_all(bytes)
    }

    /// Byte-faithful copy of the input stream; a no-op when the file was
    /// opened without an alternate.
    pub fn write_alternate(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(alt) = self.alternate.as_mut() {
            alt.write_all(bytes)?;
            self.alternate_bytes += bytes.len() as u64;
        }
        Ok(())
    }
}

/// A VMS filename split into host path components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName {
    pub dirs: Vec<String>,
    /// Filename without the version field.
    pub base: String,
    pub version: Option<i64>,
    /// Filetype (after the last dot), without the version.
    pub filetype: String,
}

/// Convert `[DIR.SUBDIR]NAME.TYPE;VERSION` into host path pieces.
pub fn convert_name(vms: &str, lowercase: bool) -> HostName {
    let vms = vms.strip_prefix('[').unwrap_or(vms);
    let (dir_part, file_part) = match vms.find(']') {
        Some(at) => (&vms[..at], &vms[at + 1..]),
        None => ("", vms),
    };

    let case = |s: &str| {
        if lowercase {
            s.to_ascii_lowercase()
        } else {
            s.to_string()
        }
    };

    let dirs: Vec<String> = dir_part
        .split('.')
        .filter(|d| !d.is_empty())
        .map(case)
        .collect();

    let (name_part, version) = match file_part.find(';') {
        Some(at) => {
            let v = file_part[at + 1..].parse::<i64>().ok();
            (&file_part[..at], v)
        }
        None => (file_part, None),
    };

    let filetype = name_part
        .rfind('.')
        .map(|at| name_part[at + 1..].to_ascii_lowercase())
        .unwrap_or_default();

    HostName {
        dirs,
        base: case(name_part),
        version,
        filetype,
    }
}

/// Report of a closed extraction.
#[derive(Debug, Clone)]
pub struct ClosedFile {
    /// Where the authoritative copy ended up after any renames.
    pub path: PathBuf,
    pub renamed: bool,
}

/// Opens and closes output files, carrying the keep-latest-version state
/// between consecutive files.
pub struct Extractor {
    opts: OutputOptions,
    last_base: String,
    last_version: i64,
}

impl Extractor {
    pub fn new(opts: OutputOptions) -> Extractor {
        Extractor {
            opts,
            last_base: String::new(),
            last_version: 0,
        }
    }

    /// Open output streams for a selected file. Returns `None` when policy
    /// says not to extract it (ignored filetype, superseded version).
    pub fn open(&mut self, meta: &FileMeta) -> io::Result<Option<OutputFiles>> {
        let lowercase = self.opts.versions != VersionPolicy::LatestOnly;
        let host = convert_name(&meta.name, lowercase);
        let delim = self.opts.delimiter;

        if !self.opts.all_types
            && IGNORED_TYPES
                .iter()
                .any(|t| host.filetype.len() >= 3 && host.filetype[..3].eq_ignore_ascii_case(t))
        {
            log::debug!("skipping '{}': ignored filetype", meta.name);
            return Ok(None);
        }

        if self.opts.versions == VersionPolicy::LatestOnly {
            if let Some(version) = host.version {
                if host.base == self.last_base {
                    if version < self.last_version {
                        log::info!(
                            "skipping '{}': older than version {} already extracted",
                            meta.name,
                            self.last_version
                        );
                        return Ok(None);
                    }
                    self.last_version = version;
                } else {
                    self.last_base = host.base.clone();
                    self.last_version = version;
                }
            }
        }

        let mut filename = host.base.clone();
        if self.opts.versions == VersionPolicy::Keep {
            if let Some(version) = host.version {
                filename.push(delim);
                filename.push_str(&version.to_string());
            }
        }

        // A VAR/VFC file without carriage-control attributes cannot be
        // translated to text; it is preserved as binary and the name records
        // how to decode it later.
        let forced_binary = meta
            .format()
            .map(|f| f.has_length_prefix())
            .unwrap_or(false)
            && !meta.recattr.any();
        if forced_binary {
            filename.push(delim);
            filename.push_str(&meta.format_tag());
            filename.push(delim);
            filename.push_str(&meta.recsize.to_string());
            for attr in meta.recattr.names() {
                filename.push(delim);
                filename.push_str(attr);
            }
        }

        let mut dir = self.opts.out_dir.clone();
        if self.opts.keep_directories {
            for d in &host.dirs {
                dir.push(d);
            }
            fs::create_dir_all(&dir)?;
        }

        let primary_path = dir.join(&filename);
        let alternate_path = if self.opts.recoverable
            && meta.format().map(|f| f.has_length_prefix()).unwrap_or(false)
            && meta.recattr.any()
        {
            Some(dir.join(format!(".{filename}")))
        } else {
            None
        };

        log::info!("extracting {} -> {}", meta.name, primary_path.display());
        OutputFiles::create(primary_path, alternate_path).map(Some)
    }

    /// Flush, rename damaged files, promote the alternate copy when it is
    /// the better artifact, and apply timestamps.
    pub fn close(
        &mut self,
        files: OutputFiles,
        meta: &FileMeta,
        errors: &FileErrors,
    ) -> io::Result<ClosedFile> {
        let OutputFiles {
            mut primary,
            alternate,
            primary_path,
            alternate_path,
            alternate_bytes,
            ..
        } = files;
        primary.flush()?;
        drop(primary);
        if let Some(mut alt) = alternate {
            alt.flush()?;
        }

        let delim = self.opts.delimiter;
        let tag = if errors.record_error {
            let at = errors.first_error_offset.unwrap_or(0);
            Some(format!("isCorruptAt{delim}0x{at:X}"))
        } else if errors.format_error {
            Some("undefinedFormat".to_string())
        } else if errors.block_error {
            Some("failedBlkDecode".to_string())
        } else if errors.size_error {
            Some("wrongSize".to_string())
        } else {
            None
        };

        let mut closed = ClosedFile {
            path: primary_path.clone(),
            renamed: false,
        };

        match tag {
            Some(tag) => {
                let damaged = append_tag(&primary_path, delim, &tag);
                fs::rename(&primary_path, &damaged)?;
                log::warn!(
                    "'{}': errors during extraction, renamed to {}",
                    meta.name,
                    damaged.display()
                );
                closed.path = damaged.clone();
                closed.renamed = true;

                // The raw copy holds everything the damaged translation may
                // have lost; it becomes the authoritative output.
                if let Some(alt_path) = &alternate_path {
                    if alternate_bytes > 0 {
                        fs::rename(alt_path, &primary_path)?;
                        log::info!(
                            "'{}': recovered raw copy at {}",
                            meta.name,
                            primary_path.display()
                        );
                        closed.path = primary_path.clone();
                        self.apply_times(&damaged, meta);
                    }
                }
            }
            None => {
                // Clean close: the insurance copy is not needed.
                if let Some(alt_path) = &alternate_path {
                    let _ = fs::remove_file(alt_path);
                }
            }
        }

        self.apply_times(&closed.path, meta);
        Ok(closed)
    }

    fn apply_times(&self, path: &Path, meta: &FileMeta) {
        if !self.opts.set_times {
            return;
        }
        let mtime = match meta.mtime {
            Some(t) => t,
            None => return,
        };
        let atime = meta.atime.unwrap_or(mtime);
        if let Err(e) = set_file_times(path, atime, mtime) {
            log::warn!("could not set times on {}: {}", path.display(), e);
        }
    }
}

fn append_tag(path: &Path, delim: char, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{name}{delim}{tag}"))
}

#[cfg(unix)]
fn set_file_times(path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: atime as libc::time_t,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: mtime as libc::time_t,
            tv_nsec: 0,
        },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_file_times(_path: &Path, _atime: i64, _mtime: i64) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::RecordAttributes;

    fn meta_named(name: &str) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            recfmt: 2,
            recattr: RecordAttributes(0x02),
            recsize: 255,
            vfcsize: 2,
            size: 10,
            ..FileMeta::default()
        }
    }

    #[test]
    fn test_convert_name() {
        let host = convert_name("[SRC.UTIL]HELLO.TXT;12", true);
        assert_eq!(host.dirs, vec!["src", "util"]);
        assert_eq!(host.base, "hello.txt");
        assert_eq!(host.version, Some(12));
        assert_eq!(host.filetype, "txt");
    }

    #[test]
    fn test_convert_name_no_directory_no_version() {
        let host = convert_name("LOGIN.COM", true);
        assert!(host.dirs.is_empty());
        assert_eq!(host.base, "login.com");
        assert_eq!(host.version, None);
        assert_eq!(host.filetype, "com");
    }

    #[test]
    fn test_convert_name_preserves_case_when_asked() {
        let host = convert_name("[SYS0]Startup.COM;1", false);
        assert_eq!(host.dirs, vec!["SYS0"]);
        assert_eq!(host.base, "Startup.COM");
    }

    #[test]
    fn test_ignored_filetypes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            ..OutputOptions::default()
        });
        assert!(ex.open(&meta_named("[BIN]TOOL.EXE;1")).unwrap().is_none());
        assert!(ex.open(&meta_named("[BIN]TOOL.OLB;1")).unwrap().is_none());
        assert!(ex.open(&meta_named("[BIN]TOOL.TXT;1")).unwrap().is_some());
    }

    #[test]
    fn test_keep_policy_appends_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            ..OutputOptions::default()
        });
        let files = ex.open(&meta_named("NOTES.TXT;7")).unwrap().unwrap();
        assert_eq!(
            files.primary_path.file_name().unwrap().to_str().unwrap(),
            "notes.txt;7"
        );
        // VAR with CR attribute in recoverable mode gets a hidden raw copy.
        assert!(files
            .alternate_path
            .as_ref()
            .unwrap()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with('.'));
    }

    #[test]
    fn test_latest_only_policy() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            versions: VersionPolicy::LatestOnly,
            ..OutputOptions::default()
        });

        assert!(ex.open(&meta_named("NOTES.TXT;7")).unwrap().is_some());
        // An older version of the same file is skipped...
        assert!(ex.open(&meta_named("NOTES.TXT;3")).unwrap().is_none());
        // ...a newer one wins...
        assert!(ex.open(&meta_named("NOTES.TXT;9")).unwrap().is_some());
        // ...and an unrelated file resets the tracking.
        assert!(ex.open(&meta_named("OTHER.TXT;1")).unwrap().is_some());
    }

    #[test]
    fn test_forced_binary_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            ..OutputOptions::default()
        });
        let meta = FileMeta {
            name: "DATA.DAT;1".to_string(),
            recfmt: 3, // VFC
            recattr: RecordAttributes(0),
            recsize: 132,
            vfcsize: 2,
            size: 10,
            ..FileMeta::default()
        };
        let files = ex.open(&meta).unwrap().unwrap();
        assert_eq!(
            files.primary_path.file_name().unwrap().to_str().unwrap(),
            "data.dat;1;VFC2;132;NONE"
        );
        // No attributes means nothing to recover with: no alternate.
        assert!(files.alternate_path.is_none());
    }

    #[test]
    fn test_directory_reproduction() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            keep_directories: true,
            ..OutputOptions::default()
        });
        let files = ex.open(&meta_named("[A.B]F.TXT;1")).unwrap().unwrap();
        assert!(files.primary_path.starts_with(dir.path().join("a").join("b")));
        assert!(dir.path().join("a").join("b").is_dir());
    }

    #[test]
    fn test_close_renames_damaged_file_and_promotes_alternate() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            set_times: false,
            ..OutputOptions::default()
        });
        let meta = meta_named("BAD.TXT;1");
        let mut files = ex.open(&meta).unwrap().unwrap();
        files.write_primary(b"partially translated").unwrap();
        files.write_alternate(b"raw input bytes").unwrap();

        let mut errors = FileErrors::default();
        errors.record_error = true;
        errors.note(0x42);

        let closed = ex.close(files, &meta, &errors).unwrap();
        assert!(closed.renamed);

        let damaged = dir.path().join("bad.txt;1;isCorruptAt;0x42");
        assert_eq!(fs::read(&damaged).unwrap(), b"partially translated");
        // The raw copy was promoted to the plain name.
        assert_eq!(
            fs::read(dir.path().join("bad.txt;1")).unwrap(),
            b"raw input bytes"
        );
        assert_eq!(closed.path, dir.path().join("bad.txt;1"));
    }

    #[test]
    fn test_clean_close_removes_alternate() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            set_times: false,
            ..OutputOptions::default()
        });
        let meta = meta_named("GOOD.TXT;1");
        let mut files = ex.open(&meta).unwrap().unwrap();
        files.write_primary(b"hello\n").unwrap();
        files.write_alternate(b"\x05\x00hello\x00").unwrap();
        let alt_path = files.alternate_path.clone().unwrap();

        let closed = ex.close(files, &meta, &FileErrors::default()).unwrap();
        assert!(!closed.renamed);
        assert_eq!(fs::read(&closed.path).unwrap(), b"hello\n");
        assert!(!alt_path.exists());
    }

    #[test]
    fn test_wrong_size_rename() {
        let dir = tempfile::tempdir().unwrap();
        let mut ex = Extractor::new(OutputOptions {
            out_dir: dir.path().to_path_buf(),
            set_times: false,
            ..OutputOptions::default()
        });
        let meta = FileMeta {
            name: "SHORT.DAT;1".to_string(),
            recfmt: 1, // FIX: no alternate
            recsize: 512,
            size: 1024,
            ..FileMeta::default()
        };
        let mut files = ex.open(&meta).unwrap().unwrap();
        files.write_primary(&[0u8; 100]).unwrap();

        let mut errors = FileErrors::default();
        errors.size_error = true;
        let closed = ex.close(files, &meta, &errors).unwrap();
        assert_eq!(
            closed.path.file_name().unwrap().to_str().unwrap(),
            "short.dat;1;wrongSize"
        );
    }
}
