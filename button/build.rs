fn main() {
    // esp-idf-sys exports the IDF toolchain environment; only the device
    // build links against it.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
