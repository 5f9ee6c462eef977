use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::{Duration, SystemTime},
};
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Keeps the non-blocking file writer alive for the lifetime of the process.
pub struct TracingGuards {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_tracing(service_name: &str) -> TracingGuards {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "/var/log/outreach".to_string());
    let log_root = PathBuf::from(log_dir).join(service_name);

    let mut file_guard = None;
    if fs::create_dir_all(&log_root).is_ok() {
        let appender = tracing_appender::rolling::daily(&log_root, format!("{service_name}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let subscriber = Registry::default()
            .with(filter)
            .with(stdout_layer)
            .with(fmt::layer().with_writer(writer));
        let _ = tracing::subscriber::set_global_default(subscriber);
        spawn_log_cleanup(log_root);
        file_guard = Some(guard);
    } else {
        let subscriber = Registry::default().with(filter).with(stdout_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    TracingGuards {
        _file_guard: file_guard,
    }
}

/// Parse a typed environment value, falling back to the default on absence
/// or parse failure.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn spawn_log_cleanup(log_root: PathBuf) {
    let retention_days = env_or("LOG_RETENTION_DAYS", 14u64);
    let interval_minutes = env_or("LOG_CLEANUP_INTERVAL_MINUTES", 360u64);
    if retention_days == 0 || interval_minutes == 0 {
        return;
    }

    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let interval = Duration::from_secs(interval_minutes * 60);

    thread::spawn(move || loop {
        if let Some(cutoff) = SystemTime::now().checked_sub(retention) {
            remove_files_older_than(&log_root, cutoff);
        }
        thread::sleep(interval);
    });
}

fn remove_files_older_than(root: &Path, cutoff: SystemTime) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_files_older_than(&path, cutoff);
            continue;
        }
        let modified = fs::metadata(&path).and_then(|meta| meta.modified());
        if let Ok(modified) = modified {
            if modified < cutoff {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

/// Bind on all interfaces for container compatibility.
pub async fn bind_listener(port: u16) -> TcpListener {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.expect("bind listener")
}

/// Resolves when ctrl-c or SIGTERM arrives, for graceful shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::env_or;

    #[test]
    fn env_or_falls_back_on_missing_key() {
        assert_eq!(env_or("OUTREACH_TEST_MISSING_KEY", 42u16), 42);
    }
}
