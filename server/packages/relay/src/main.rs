fn main() {
    if let Err(err) = edge_relay::cli::run_edge_relay() {
        tracing::error!(error = %err, "edge-relay failed");
        std::process::exit(1);
    }
}
