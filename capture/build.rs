use grev::git_revision_auto;

fn main() {
    let revision = git_revision_auto("..")
        .unwrap_or(None)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=STREAMTRACE_REVISION={revision}");
}
