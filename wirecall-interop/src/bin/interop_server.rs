use clap::Parser;
use wirecall_core::{Server, ServerCredentials};
use wirecall_interop::test_service;

/// PEM material for the TLS listener, signed by the bundled test CA.
const SERVER_CERT: &[u8] = include_bytes!("../../data/server1.pem");
const SERVER_KEY: &[u8] = include_bytes!("../../data/server1.key");

#[derive(Parser, Debug)]
#[command(name = "interop-server", about = "Reference interop test server")]
struct Cli {
    /// Port to listen on (0 for ephemeral)
    #[arg(long = "port", default_value_t = 0)]
    port: u16,

    /// Serve TLS using the bundled test certificate
    #[arg(long = "use_tls")]
    use_tls: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let credentials = if cli.use_tls {
        ServerCredentials::ssl(SERVER_CERT, SERVER_KEY)
    } else {
        ServerCredentials::insecure()
    };

    let server = Server::builder()
        .add_service(test_service())
        .credentials(credentials)
        .bind(&format!("0.0.0.0:{}", cli.port))
        .await?;

    println!("Server attaching to port {}", server.local_addr().port());

    server.serve().await?;
    Ok(())
}
