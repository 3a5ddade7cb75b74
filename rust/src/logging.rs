/// Default filter: core events at debug, dependencies at info.
const DEFAULT_FILTER: &str = "chatsync_core=debug,info";

/// Installs the global tracing subscriber for the sync core.
///
/// On iOS events go to os_log under the `dev.chatsync.core` subsystem and are also appended to
/// `chatsync.log` inside `data_dir`. Android routes them to logcat with the `chatsync` tag.
/// Everywhere else they print to stderr, and `RUST_LOG` replaces [`DEFAULT_FILTER`].
///
/// `FfiApp::new()` calls this first thing; a subscriber that is already installed wins.
pub fn init_logging(#[allow(unused)] data_dir: &str) {
    #[cfg(target_os = "ios")]
    {
        use tracing_subscriber::prelude::*;

        let os_log = tracing_oslog::OsLogger::new("dev.chatsync.core", "default");

        // Keep a copy in the data dir; os_log filtering can hide debug lines.
        let log_path = std::path::Path::new(data_dir).join("chatsync.log");
        let _ = std::fs::create_dir_all(data_dir);
        let env_filter = tracing_subscriber::EnvFilter::new(DEFAULT_FILTER);

        let file_layer = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok()
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
            });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(os_log)
            .with(file_layer)
            .try_init();
    }

    #[cfg(target_os = "android")]
    {
        use tracing_subscriber::prelude::*;

        let android_layer = paranoid_android::layer("chatsync")
            .with_filter(tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));

        let _ = tracing_subscriber::registry()
            .with(android_layer)
            .try_init();
    }

    #[cfg(not(any(target_os = "ios", target_os = "android")))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| DEFAULT_FILTER.into()),
            )
            .try_init();
    }
}
