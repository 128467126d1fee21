use tracing_subscriber::EnvFilter;

fn filter_directive(level: &str) -> String {
    match level.trim() {
        "" => "info".to_string(),
        level => level.to_lowercase(),
    }
}

/// Installs the global subscriber on stderr so `--json` output stays clean. `RUST_LOG` wins
/// over the configured level. Worker thread names (`device-worker-<n>`) are included.
pub fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false);

    if cfg!(debug_assertions) {
        let _ = builder.try_init();
    } else {
        let _ = builder.json().try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_level_falls_back_to_info() {
        assert_eq!(filter_directive("  "), "info");
        assert_eq!(filter_directive("DEBUG"), "debug");
        assert_eq!(filter_directive("droidrun_lib=trace"), "droidrun_lib=trace");
    }
}
