use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=CATALOG_SYNC_ROOT_HINT");

    // Fall back to the package directory so development builds find the
    // bundled schema without any environment setup.
    let hint = env::var("CATALOG_SYNC_ROOT_HINT")
        .ok()
        .or_else(|| env::var("CARGO_MANIFEST_DIR").ok());

    if let Some(raw_hint) = hint {
        let candidate = PathBuf::from(raw_hint);
        let canonical = candidate.canonicalize().unwrap_or(candidate);

        println!("cargo:rustc-env=CATALOG_SYNC_ROOT_HINT={}", canonical.display());
    }
}
