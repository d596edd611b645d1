use std::process::Command;

fn git(args: &[&str]) -> Option<Vec<u8>> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(output.stdout)
}

fn main() {
    // Get git SHA
    let git_sha = git(&["rev-parse", "--short", "HEAD"])
        .and_then(|out| String::from_utf8(out).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    // Check if working directory is dirty
    let dirty = match git(&["status", "--porcelain"]) {
        Some(status) if !status.is_empty() => "-dirty",
        _ => "",
    };

    println!("cargo:rustc-env=GIT_SHA={}{}", git_sha, dirty);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
