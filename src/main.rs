fn main() {
    if let Err(e) = streamhub_lib::run() {
        eprintln!("streamhub: {e}");
        std::process::exit(1);
    }
}
