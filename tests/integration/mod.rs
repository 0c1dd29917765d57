//! End-to-end tests over synthetic model directories and adapter files

mod fixtures;
mod fusion_tests;
mod pipeline_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sdlora=debug")
        .try_init();
}
