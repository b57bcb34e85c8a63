use buffer_test_types::HarnessConfig;
use std::env;
use std::fs;

fn main() {
    println!("cargo:rerun-if-changed=config/default.json");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let json_str = fs::read_to_string(format!("{}/config/default.json", manifest_dir))
        .expect("Failed to read config/default.json");

    let config: HarnessConfig = serde_json::from_str(&json_str)
        .expect("BUILD FAILED: config/default.json does not match HarnessConfig");

    let binary = bincode::serialize(&config).expect("Failed to serialize config to bincode");

    let out_dir = env::var("OUT_DIR").unwrap();
    fs::write(format!("{}/default_config.bin", out_dir), binary)
        .expect("Failed to write binary config");
}
