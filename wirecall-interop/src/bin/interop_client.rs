use clap::Parser;
use std::process;
use wirecall_interop::{run_test_case, InteropTarget};

/// The bundled test CA, matching the interop server's certificate.
const TEST_CA: &[u8] = include_bytes!("../../data/ca.pem");

#[derive(Parser, Debug)]
#[command(name = "interop-client", about = "Interop test client")]
struct Cli {
    /// Server host to connect to
    #[arg(long = "server_host", default_value = "localhost")]
    server_host: String,

    /// Server port to connect to
    #[arg(long = "server_port")]
    server_port: u16,

    /// TLS name override for the test certificate
    #[arg(long = "server_host_override")]
    server_host_override: Option<String>,

    /// The name of the test case to run
    #[arg(long = "test_case", default_value = "large_unary")]
    test_case: String,

    /// Connect with TLS
    #[arg(long = "use_tls")]
    use_tls: bool,

    /// Trust the bundled test CA instead of the native roots
    #[arg(long = "use_test_ca")]
    use_test_ca: bool,

    /// Identity asserted by the auth test cases
    #[arg(long = "default_service_account", default_value = "")]
    default_service_account: String,

    /// OAuth scope asserted by the auth test cases
    #[arg(long = "oauth_scope", default_value = "")]
    oauth_scope: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let target = InteropTarget {
        address: format!("{}:{}", cli.server_host, cli.server_port),
        use_tls: cli.use_tls,
        root_certs: cli.use_test_ca.then(|| TEST_CA.to_vec()),
        server_host_override: cli.server_host_override,
        default_service_account: cli.default_service_account,
        oauth_scope: cli.oauth_scope,
    };

    match run_test_case(&cli.test_case, &target).await {
        Ok(()) => {
            println!("OK: {}", cli.test_case);
        }
        Err(e) => {
            eprintln!("Test case {} failed: {e}", cli.test_case);
            process::exit(1);
        }
    }
}
