use std::process::Command;

fn git(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Expose the git state to every CLI as `GIT_COMMIT` and `RELEASE_VERSION`.
///
/// All three tools (vmsx, tape-info, tape-extract) pull this in from their
/// `build.rs` so their `--version` output stays in lock step. Builds from a
/// source tarball (no `.git`) get empty strings and the banner falls back to
/// the crate version alone.
pub fn emit_git_metadata() {
    // The workspace members sit one level below the repository root, so the
    // git bookkeeping lives at `../.git` relative to each crate.
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs/tags");
    println!("cargo:rerun-if-changed=../build/shared_git_metadata.rs");

    let commit = git(&["rev-parse", "--short=12", "HEAD"]);
    println!("cargo:rustc-env=GIT_COMMIT={commit}");

    // Nearest tag plus distance, e.g. `v1.2-14-gdeadbeef`; empty when the
    // repository has no tags yet.
    let release = git(&["describe", "--tags", "--always", "--dirty"]);
    println!("cargo:rustc-env=RELEASE_VERSION={release}");
}
