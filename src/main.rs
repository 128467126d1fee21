fn main() {
    std::process::exit(droidrun_lib::run())
}
