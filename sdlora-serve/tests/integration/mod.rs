//! Orchestrator and HTTP tests over a synthetic model and a mock runtime

mod fixtures;
mod orchestrator_tests;
mod server_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sdlora=debug,sdlora_serve=debug")
        .try_init();
}
