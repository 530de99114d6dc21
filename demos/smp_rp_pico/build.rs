//! Copies `memmap/memory.x` into the build output directory so
//! `cortex-m-rt`'s linker invocation (`-T memory.x`) can find it, the same
//! `build.rs` shape `cortex-m-rt`-based board crates use.
use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    fs::copy("memmap/memory.x", out.join("memory.x")).unwrap();
    println!("cargo:rustc-link-search={}", out.display());
    println!("cargo:rerun-if-changed=memmap/memory.x");
}
