use std::process;

fn main() {
    if let Err(err) = syncbatch::app::run() {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}
