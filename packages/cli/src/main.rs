fn main() {
    if let Err(err) = quarry_cli::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
