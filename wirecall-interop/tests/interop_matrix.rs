//! The canonical interop matrix, run end to end against the in-process
//! reference server.

mod common;

use common::{start_plaintext, start_tls};
use wirecall_interop::run_test_case;

async fn run_plaintext(case: &str) {
    let (_server, target) = start_plaintext().await;
    run_test_case(case, &target)
        .await
        .unwrap_or_else(|e| panic!("case {case} failed: {e}"));
}

async fn run_tls(case: &str) {
    let (_server, target) = start_tls().await;
    run_test_case(case, &target)
        .await
        .unwrap_or_else(|e| panic!("case {case} failed: {e}"));
}

#[tokio::test]
async fn empty_unary() {
    run_plaintext("empty_unary").await;
}

#[tokio::test]
async fn large_unary() {
    run_plaintext("large_unary").await;
}

#[tokio::test]
async fn client_streaming() {
    run_plaintext("client_streaming").await;
}

#[tokio::test]
async fn server_streaming() {
    run_plaintext("server_streaming").await;
}

#[tokio::test]
async fn ping_pong() {
    run_plaintext("ping_pong").await;
}

#[tokio::test]
async fn empty_stream() {
    run_plaintext("empty_stream").await;
}

#[tokio::test]
async fn cancel_after_begin() {
    run_plaintext("cancel_after_begin").await;
}

#[tokio::test]
async fn cancel_after_first_response() {
    run_plaintext("cancel_after_first_response").await;
}

#[tokio::test]
async fn timeout_on_sleeping_server() {
    run_plaintext("timeout_on_sleeping_server").await;
}

#[tokio::test]
async fn custom_metadata() {
    run_plaintext("custom_metadata").await;
}

#[tokio::test]
async fn large_unary_over_tls() {
    run_tls("large_unary").await;
}

#[tokio::test]
async fn ping_pong_over_tls() {
    run_tls("ping_pong").await;
}

#[tokio::test]
async fn compute_engine_creds() {
    run_tls("compute_engine_creds").await;
}

#[tokio::test]
async fn service_account_creds() {
    run_tls("service_account_creds").await;
}

#[tokio::test]
async fn jwt_token_creds() {
    run_tls("jwt_token_creds").await;
}

#[tokio::test]
async fn oauth2_auth_token() {
    run_tls("oauth2_auth_token").await;
}

#[tokio::test]
async fn per_rpc_creds() {
    run_tls("per_rpc_creds").await;
}

#[tokio::test]
async fn unknown_case_is_an_error() {
    let (_server, target) = start_plaintext().await;
    assert!(run_test_case("no_such_case", &target).await.is_err());
}
