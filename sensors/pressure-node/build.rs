use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    embuild::espidf::sysenv::output();

    // CONFIG_PARTITION_TABLE_CUSTOM_FILENAME is resolved relative to the cmake
    // build directory, so the table has to sit next to the generated project
    if let (Ok(out_dir), Ok(manifest_dir)) = (env::var("OUT_DIR"), env::var("CARGO_MANIFEST_DIR")) {
        let src = PathBuf::from(manifest_dir).join("partitions.csv");
        let dst = PathBuf::from(out_dir).join("partitions.csv");

        if src.exists() {
            match fs::copy(&src, &dst) {
                Ok(_) => println!("cargo:rerun-if-changed=partitions.csv"),
                Err(e) => println!("cargo:warning=Failed to copy partitions.csv: {}", e),
            }
        }
    }
}
