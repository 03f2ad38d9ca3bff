//! `--version` reporting shared by the CLI tools.

/// Print the version report: tool name and crate version on one line, with
/// whatever git metadata the build captured appended in parentheses (see
/// `build/shared_git_metadata.rs`). Tarball builds have neither a tag nor a
/// commit and get the bare crate version.
pub fn print_version(tool: &str, crate_version: &str, release: &str, commit: &str) {
    if !release.is_empty() {
        println!("{tool} {crate_version} ({release})");
    } else if !commit.is_empty() {
        println!("{tool} {crate_version} (git {commit})");
    } else {
        println!("{tool} {crate_version}");
    }
    println!("part of the vms-saveset-tools suite, GPL-2.0-or-later");
}
