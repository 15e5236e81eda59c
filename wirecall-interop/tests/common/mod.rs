// Shared helpers for the end-to-end suites. Not every test file uses
// every helper, hence the allow.
#![allow(dead_code)]

use wirecall_core::{Server, ServerCredentials, ServerHandle};
use wirecall_interop::{test_service, InteropTarget};

pub const SERVER_CERT: &[u8] = include_bytes!("../../data/server1.pem");
pub const SERVER_KEY: &[u8] = include_bytes!("../../data/server1.key");
pub const TEST_CA: &[u8] = include_bytes!("../../data/ca.pem");

/// The name the test certificate is issued for.
pub const CERT_HOST: &str = "foo.test.google.fr";

pub const TEST_ACCOUNT: &str = "tester@example.com";
pub const TEST_SCOPE: &str = "test.scope";

/// Start an in-process plaintext server on an ephemeral port.
///
/// The handle aborts the server on drop; keep it alive for the duration
/// of the test.
pub async fn start_plaintext() -> (ServerHandle, InteropTarget) {
    let server = Server::builder()
        .add_service(test_service())
        .bind("127.0.0.1:0")
        .await
        .expect("failed to bind test server");
    let port = server.local_addr().port();
    let handle = server.spawn();
    let target = InteropTarget::plaintext(format!("127.0.0.1:{port}"));
    (handle, target)
}

/// Start an in-process TLS server using the bundled test certificate.
pub async fn start_tls() -> (ServerHandle, InteropTarget) {
    let server = Server::builder()
        .add_service(test_service())
        .credentials(ServerCredentials::ssl(SERVER_CERT, SERVER_KEY))
        .bind("127.0.0.1:0")
        .await
        .expect("failed to bind TLS test server");
    let port = server.local_addr().port();
    let handle = server.spawn();
    let target = InteropTarget {
        address: format!("127.0.0.1:{port}"),
        use_tls: true,
        root_certs: Some(TEST_CA.to_vec()),
        server_host_override: Some(CERT_HOST.to_string()),
        default_service_account: TEST_ACCOUNT.to_string(),
        oauth_scope: TEST_SCOPE.to_string(),
    };
    (handle, target)
}
