use funcgate::admin::{AdminServer, PKG_NAME, VERSION};
use funcgate::config::Config;
use funcgate::host::Host;
use funcgate::server::HostServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("funcgate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("funcgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Function sources resolve against the config file's directory
    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let host = Host::build(&config, &base_dir, shutdown_rx.clone())?;
    let watchers = host.watch_all();
    if watchers > 0 {
        info!(count = watchers, "Source watchers started");
    }

    let http_port = config.server.http_port();
    let http_handle = if http_port > 0 {
        let http_addr: SocketAddr = format!("{}:{}", config.server.bind, http_port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.server.bind, port = http_port, error = %e, "Invalid HTTP bind address");
                anyhow::anyhow!("Invalid HTTP bind address: {}", e)
            })?;
        let server = HostServer::new(http_addr, host.dispatcher(), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Function host server error");
            }
        }))
    } else {
        None
    };

    // Admin API is always bound to loopback
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "No admin_token configured, using a generated one");
        token
    });

    let admin_server = AdminServer::new(admin_addr, host.admin_state(admin_token), shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("SIGINT, stopping function host");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM, stopping function host");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "SIGHUP, reloading functions and proxies");
                    match Config::load(&config_path).and_then(|config| host.reload(&config)) {
                        Ok(result) => {
                            info!(
                                added = result.added.len(),
                                removed = result.removed.len(),
                                updated = result.updated.len(),
                                "Functions and proxies reloaded"
                            );
                            if !result.added.is_empty() {
                                info!(functions = ?result.added, "Functions added");
                            }
                            if !result.removed.is_empty() {
                                info!(functions = ?result.removed, "Functions removed");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Reload rejected, keeping current functions and proxies");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C, stopping function host");
    }

    let _ = shutdown_tx.send(true);

    let mut watchers = host.take_watchers();
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
        for watcher in watchers.iter_mut() {
            let _ = watcher.await;
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Shutdown wait timed out, aborting source watchers");
        for watcher in &watchers {
            watcher.abort();
        }
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Function host stopped");
    Ok(())
}

/// PID file held under `flock` for the life of the process
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting function host");

    let http_port = config.server.http_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        admin_port = config.server.admin_port,
        host_name = %config.server.host_name,
        route_prefix = %config.server.route_prefix(),
        "Server configuration"
    );

    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Backend client settings"
    );

    info!(
        enabled = config.watch.enabled,
        interval_ms = config.watch.interval_ms,
        debounce_ms = config.watch.debounce_ms,
        restore = config.watch.restore_command.is_some(),
        "Source watch settings"
    );

    info!(
        function_count = config.functions.len(),
        functions = ?config.functions.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        proxy_count = config.proxies.len(),
        proxies = ?config.proxies.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "Configured functions and proxies"
    );
}
