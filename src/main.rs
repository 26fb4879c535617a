#[tokio::main]
async fn main() {
    rtu_sniff::init_logging();
    let matches = rtu_sniff::cli::parse_args();

    if let Err(err) = rtu_sniff::cli::actions::run(&matches).await {
        log::error!("{err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
