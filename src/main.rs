fn main() {
    match retrace::run::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("retrace: error: {}", err);
            std::process::exit(1);
        }
    }
}
