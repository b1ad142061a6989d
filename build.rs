fn main() {
    let hash = git_revision_hash();
    if let Some(ref rev) = hash {
        println!("cargo:rustc-env=NDT7_SPEED_BUILD_GIT_HASH={}", rev);
    }
    set_version_string(hash.as_deref());
}

/// The short hash of the current git revision, if built from a checkout.
fn git_revision_hash() -> Option<String> {
    use std::process::Command;

    let args = &["rev-parse", "--short=10", "HEAD"];
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if rev.is_empty() {
        None
    } else {
        Some(rev)
    }
}

/// Make the `--version` string available as `NDT7_SPEED_VERSION`.
fn set_version_string(hash: Option<&str>) {
    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let version = match hash {
        Some(rev) => format!("{} (rev {})", version, rev),
        None => version,
    };
    println!("cargo:rustc-env=NDT7_SPEED_VERSION={}", version);
}
