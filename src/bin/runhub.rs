use runhub::app::{parse_service_args, run_service};

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = parse_service_args(&args).map_err(|err| err.to_string())?;
    run_service(parsed).map_err(|err| err.to_string())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
