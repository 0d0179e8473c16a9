use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let header = PathBuf::from(&crate_dir).join("include").join("dynvtable.h");

    // Reads cbindgen.toml from the crate root
    cbindgen::generate(&crate_dir)
        .expect("Unable to generate bindings")
        .write_to_file(header);

    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");
}
