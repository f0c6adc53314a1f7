//! Build script for zonestor
//!
//! Links libzbd when the `libzbd` feature is enabled. Without it the crate
//! builds against the in-memory mock only.
//!
//! # Prerequisites
//!
//! ```bash
//! # Ubuntu/Debian:
//! sudo apt-get install libzbd-dev
//!
//! # Or build from source:
//! git clone https://github.com/westerndigitalcorporation/libzbd.git
//! cd libzbd
//! sh ./autogen.sh
//! ./configure
//! make -j$(nproc)
//! sudo make install
//! sudo ldconfig
//! ```
//!
//! # Environment Variables
//!
//! - `LIBZBD_DIR` - Path to a libzbd installation (default: /usr/local)

use std::env;
use std::path::PathBuf;

fn main() {
    // Only run linking logic when the libzbd feature is enabled
    if !cfg!(feature = "libzbd") {
        return;
    }

    println!("cargo:rerun-if-env-changed=LIBZBD_DIR");

    let zbd_dir = env::var("LIBZBD_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local"));

    let zbd_lib_dir = zbd_dir.join("lib");
    if zbd_lib_dir.exists() {
        println!("cargo:rustc-link-search=native={}", zbd_lib_dir.display());
    }

    // Some distros install into lib64
    let zbd_lib64_dir = zbd_dir.join("lib64");
    if zbd_lib64_dir.exists() {
        println!("cargo:rustc-link-search=native={}", zbd_lib64_dir.display());
    }

    println!("cargo:rustc-link-search=native=/usr/lib");
    println!("cargo:rustc-link-search=native=/usr/lib64");

    println!("cargo:rustc-link-lib=dylib=zbd");
}
