fn main() {
    // Host builds (tests, simulation) have no ESP-IDF toolchain to configure.
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();
}
