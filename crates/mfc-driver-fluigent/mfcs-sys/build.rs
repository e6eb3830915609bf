//! Build script for mfcs-sys.
//!
//! With the `mfcs-sdk` feature the vendor library is linked, searched in
//! `MFCS_LIB_DIR` when set.

fn main() {
    println!("cargo:rerun-if-env-changed=MFCS_LIB_DIR");

    #[cfg(feature = "mfcs-sdk")]
    {
        if let Ok(dir) = std::env::var("MFCS_LIB_DIR") {
            println!("cargo:rustc-link-search=native={dir}");
        }
        println!("cargo:rustc-link-lib=dylib=mfcs64");
    }
}
