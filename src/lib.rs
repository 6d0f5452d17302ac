pub mod config;
pub mod models;
pub mod pipeline;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use pipeline::safety::policy::{CompiledPolicy, PolicyError, PolicySource, SafetyPolicy};

/// Initialize tracing once per process. `RUST_LOG` overrides the default
/// filter. Logs go to stderr so stdout stays free for program output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolve and compile the active safety policy
/// (env var path, then app data directory, then built-in tables).
pub fn load_policy() -> Result<(Arc<CompiledPolicy>, PolicySource), PolicyError> {
    let (policy, source) = SafetyPolicy::resolve()?;
    let compiled = match source {
        PolicySource::BuiltIn => CompiledPolicy::builtin(),
        _ => Arc::new(CompiledPolicy::compile(policy)?),
    };
    tracing::info!(
        source = ?source,
        rules = compiled.rules.len(),
        "Safety policy loaded ({} v{})",
        config::APP_NAME,
        config::APP_VERSION
    );
    Ok((compiled, source))
}
