use carrier_server::core::BrokerApp;

#[tokio::main]
async fn main() {
    if let Err(e) = BrokerApp::run().await {
        eprintln!("\nError: {}\n", e);
        std::process::exit(1);
    }
}
