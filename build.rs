fn main() {
    let mixed_mode = std::env::var("CARGO_FEATURE_MIXED_MODE").is_ok();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if mixed_mode && target_os == "linux" {
        println!("cargo:rustc-link-lib=unwind");
        println!("cargo:rustc-link-lib=unwind-ptrace");
        println!("cargo:rustc-link-lib=unwind-generic");
    }
}
