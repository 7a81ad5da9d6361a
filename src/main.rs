use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use concentration_monitor::aggregator::PeriodicAggregator;
use concentration_monitor::bus::{MsgpackSerializer, Publisher, Subscriber, TcpPublisher, TcpSubscriber};
use concentration_monitor::config::Config;
use concentration_monitor::error::ConfigError;
use concentration_monitor::messages::{AnalysisMsg, MonitorMsg};
use concentration_monitor::scoring::{ScoringEngine, ScoringLoop};
use concentration_monitor::storage::SqliteRecordStore;
use concentration_monitor::store::MonitorState;
use concentration_monitor::stream::SseServer;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Which tiers of the pipeline this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Score analysis results and publish concentration status
    Scorer,
    /// Receive status, aggregate it and stream it to browsers
    Web,
    /// Both tiers in one process
    All,
}

/// Command-line arguments for the concentration monitor
#[derive(Parser)]
#[command(
    name = "concentration-monitor",
    about = "Webcam concentration monitor - scoring, aggregation and live streaming",
    long_about = "Subscribes to face analysis results, turns them into a concentration score, \
                  rolls the score up into fixed time buckets stored in SQLite, and streams \
                  live updates as server-sent events."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Tiers to run
    #[arg(long, value_enum, default_value_t = Role::All)]
    role: Role,
}

impl Cli {
    /// Settings from `--config`, or the defaults
    ///
    /// A file that cannot be read or does not validate is reported and replaced by
    /// the defaults, so a broken file never keeps the monitor from starting.
    fn load_config(&self) -> Config {
        let Some(path) = self.config.as_deref() else {
            info!("No --config given, using default settings");
            return Config::default();
        };
        match Config::from_file(path) {
            Ok(config) => {
                info!("Loaded settings from {}", path.display());
                config
            }
            Err(ConfigError::ReadError(e)) => {
                warn!("Cannot read {} ({}), using default settings", path.display(), e);
                Config::default()
            }
            Err(e) => {
                error!("Rejected {}: {}", path.display(), e);
                warn!("Using default settings instead");
                Config::default()
            }
        }
    }
}

/// Reject settings that cannot work for the tiers `role` runs
fn check_role(role: Role, config: &Config) -> Result<(), String> {
    let runs_scorer = matches!(role, Role::Scorer | Role::All);
    let runs_web = matches!(role, Role::Web | Role::All);

    if runs_scorer && is_ephemeral(&config.bus.analysis_addr) {
        return Err(format!(
            "bus.analysis_addr {} does not name an analyzer to connect to",
            config.bus.analysis_addr
        ));
    }
    // Only a co-located scorer can hand its ephemeral port to the web tier
    if role == Role::Web && is_ephemeral(&config.bus.monitor_addr) {
        return Err(format!(
            "bus.monitor_addr {} does not name a scorer to connect to",
            config.bus.monitor_addr
        ));
    }
    if role == Role::All
        && config.web.bind_addr == config.bus.monitor_addr
        && !is_ephemeral(&config.web.bind_addr)
    {
        return Err(format!(
            "web.bind_addr and bus.monitor_addr both use {}",
            config.web.bind_addr
        ));
    }
    if runs_web {
        if let Some(dir) = config.aggregator.db_path.parent() {
            if !dir.as_os_str().is_empty() && !dir.is_dir() {
                return Err(format!(
                    "directory of aggregator.db_path does not exist: {}",
                    dir.display()
                ));
            }
        }
    }
    Ok(())
}

fn is_ephemeral(addr: &str) -> bool {
    addr.rsplit_once(':').is_some_and(|(_, port)| port == "0")
}

/// Analysis subscriber, scoring engine and monitor publisher
struct ScorerTier {
    engine: Arc<ScoringEngine>,
    subscriber: TcpSubscriber<AnalysisMsg>,
    publisher: Arc<TcpPublisher<MonitorMsg>>,
    scoring_loop: ScoringLoop,
}

/// Monitor subscriber, aggregator and event-stream server
struct WebTier {
    state: MonitorState,
    subscriber: TcpSubscriber<MonitorMsg>,
    aggregator: PeriodicAggregator,
    server: Option<SseServer>,
}

/// Owns every component of the configured tiers and their lifecycle
pub struct ConcentrationMonitor {
    config: Config,
    scorer: Option<ScorerTier>,
    web: Option<WebTier>,
    shutdown_sender: Sender<()>,
    shutdown_receiver: Receiver<()>,
}

impl ConcentrationMonitor {
    /// Build the components for `role`
    ///
    /// Publishers are bound and the database is opened here so that configuration
    /// problems surface before anything starts.
    pub fn new(config: Config, role: Role) -> Result<Self> {
        info!("Initializing concentration monitor as {:?}", role);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel();

        let scorer = match role {
            Role::Scorer | Role::All => Some(Self::build_scorer(&config)?),
            Role::Web => None,
        };

        let web = match role {
            Role::Web | Role::All => {
                // A co-located scorer may have been bound to an ephemeral port
                let monitor_addr = match &scorer {
                    Some(tier) => tier.publisher.local_addr().to_string(),
                    None => config.bus.monitor_addr.clone(),
                };
                Some(Self::build_web(&config, &monitor_addr)?)
            }
            Role::Scorer => None,
        };

        Ok(Self {
            config,
            scorer,
            web,
            shutdown_sender,
            shutdown_receiver,
        })
    }

    fn build_scorer(config: &Config) -> Result<ScorerTier> {
        let bus = &config.bus;
        let subscriber = TcpSubscriber::connect(
            bus.analysis_addr.as_str(),
            bus.analysis_topic.as_str(),
            MsgpackSerializer::<AnalysisMsg>::new(),
        )
        .with_context(|| format!("resolving analysis address {}", bus.analysis_addr))?
        .with_poll_interval(bus.poll_interval());

        let publisher = TcpPublisher::bind(
            bus.monitor_addr.as_str(),
            bus.monitor_topic.as_str(),
            MsgpackSerializer::<MonitorMsg>::new(),
        )
        .with_context(|| format!("binding monitor publisher on {}", bus.monitor_addr))?;

        Ok(ScorerTier {
            engine: Arc::new(ScoringEngine::new(config.scoring.engine.clone())),
            subscriber,
            publisher: Arc::new(publisher),
            scoring_loop: ScoringLoop::new(config.scoring.tick_interval()),
        })
    }

    fn build_web(config: &Config, monitor_addr: &str) -> Result<WebTier> {
        let bus = &config.bus;
        let subscriber = TcpSubscriber::connect(
            monitor_addr,
            bus.monitor_topic.as_str(),
            MsgpackSerializer::<MonitorMsg>::new(),
        )
        .with_context(|| format!("resolving monitor address {}", monitor_addr))?
        .with_poll_interval(bus.poll_interval());

        let state = MonitorState::new(config.web.evolution_threshold);
        let records = SqliteRecordStore::open(&config.aggregator.db_path).with_context(|| {
            format!(
                "opening record store {}",
                config.aggregator.db_path.display()
            )
        })?;
        let aggregator = PeriodicAggregator::new(
            config.aggregator.bucket_width(),
            Arc::clone(&state.store),
            Box::new(records),
        )?;

        Ok(WebTier {
            state,
            subscriber,
            aggregator,
            server: None,
        })
    }

    /// Start every component; returns once all threads are running
    pub fn start(&mut self) -> Result<()> {
        if let Some(web) = self.web.as_mut() {
            web.state
                .attach(&mut web.subscriber)
                .context("starting monitor subscriber")?;
            web.aggregator.start().context("starting aggregator")?;
            let server = SseServer::bind(
                self.config.web.bind_addr.as_str(),
                Arc::clone(&web.state.store),
                Arc::clone(&web.state.accumulator),
            )
            .with_context(|| format!("binding event stream on {}", self.config.web.bind_addr))?;
            web.server = Some(server);
            info!("Web tier started");
        }

        if let Some(scorer) = self.scorer.as_mut() {
            scorer
                .engine
                .attach(&mut scorer.subscriber)
                .context("starting analysis subscriber")?;
            let publisher: Arc<dyn Publisher<MonitorMsg>> = scorer.publisher.clone();
            scorer
                .scoring_loop
                .start(Arc::clone(&scorer.engine), publisher)
                .context("starting scoring loop")?;
            info!(
                "Scorer started, publishing on {}",
                scorer.publisher.local_addr()
            );
        }

        Ok(())
    }

    /// Stop every component, upstream first
    pub fn stop(&mut self) {
        info!("Stopping concentration monitor");

        if let Some(scorer) = self.scorer.as_mut() {
            scorer.subscriber.close();
            scorer.scoring_loop.stop();
            scorer.publisher.close();
        }

        if let Some(web) = self.web.as_mut() {
            web.subscriber.close();
            web.aggregator.stop();
            if let Some(mut server) = web.server.take() {
                server.stop();
            }
            info!(
                "Accumulated score at shutdown: {:.1}",
                web.state.accumulator.accumulated()
            );
        }

        info!("Concentration monitor stopped");
    }

    /// Block until a shutdown signal is received
    pub fn wait_for_shutdown(&self) -> Result<()> {
        info!("Waiting for shutdown signal...");
        self.shutdown_receiver
            .recv()
            .context("shutdown channel closed")?;
        info!("Shutdown signal received");
        Ok(())
    }

    fn stream_addr(&self) -> Option<SocketAddr> {
        self.web
            .as_ref()
            .and_then(|web| web.server.as_ref())
            .map(|server| server.local_addr())
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("Starting concentration monitor");

    let config = cli.load_config();
    if let Err(e) = check_role(cli.role, &config) {
        error!("Cannot run as {:?}: {}", cli.role, e);
        std::process::exit(1);
    }

    let mut monitor = match ConcentrationMonitor::new(config, cli.role) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to initialize: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = monitor.start() {
        error!("Failed to start: {:#}", e);
        monitor.stop();
        std::process::exit(1);
    }

    let shutdown_sender = monitor.shutdown_sender.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        if let Err(e) = shutdown_sender.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    }) {
        error!("Failed to install SIGINT handler: {}", e);
        monitor.stop();
        std::process::exit(1);
    }

    if let Some(addr) = monitor.stream_addr() {
        info!("Live events at http://{}/monitor. Press Ctrl+C to stop.", addr);
    } else {
        info!("Concentration monitor is running. Press Ctrl+C to stop.");
    }

    if let Err(e) = monitor.wait_for_shutdown() {
        error!("Error during shutdown wait: {:#}", e);
    }

    monitor.stop();
    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};
    use std::time::Duration;

    fn cli(config: Option<PathBuf>) -> Cli {
        Cli {
            config,
            verbose: false,
            role: Role::All,
        }
    }

    fn ephemeral_config(db_path: PathBuf) -> Config {
        let mut config = Config::default();
        config.bus.analysis_addr = "127.0.0.1:1".to_string();
        config.bus.monitor_addr = "127.0.0.1:0".to_string();
        config.web.bind_addr = "127.0.0.1:0".to_string();
        config.aggregator.db_path = db_path;
        config
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let config = cli(Some(PathBuf::from("/nonexistent/monitor.toml"))).load_config();
        assert_eq!(config, Config::default());
        assert_eq!(cli(None).load_config(), Config::default());
    }

    #[test]
    fn test_config_file_overrides_bucket_width() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[aggregator]\nbucket_minutes = 10\n").unwrap();
        let config = cli(Some(file.path().to_path_buf())).load_config();
        assert_eq!(config.aggregator.bucket_width(), Duration::from_secs(600));
    }

    #[test]
    fn test_rejected_config_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[aggregator]\nbucket_minutes = 7\n").unwrap();
        assert_eq!(
            cli(Some(file.path().to_path_buf())).load_config(),
            Config::default()
        );
    }

    #[test]
    fn test_default_settings_suit_every_role() {
        let config = Config::default();
        for role in [Role::Scorer, Role::Web, Role::All] {
            assert_eq!(check_role(role, &config), Ok(()));
        }
    }

    #[test]
    fn test_web_role_needs_a_scorer_address() {
        let mut config = Config::default();
        config.bus.monitor_addr = "127.0.0.1:0".to_string();
        assert!(check_role(Role::Web, &config).is_err());
        // A co-located scorer publishes its bound port to the web tier
        assert!(check_role(Role::All, &config).is_ok());
    }

    #[test]
    fn test_scorer_needs_an_analyzer_address() {
        let mut config = Config::default();
        config.bus.analysis_addr = "0.0.0.0:0".to_string();
        assert!(check_role(Role::Scorer, &config).is_err());
        assert!(check_role(Role::Web, &config).is_ok());
    }

    #[test]
    fn test_stream_and_monitor_bus_cannot_share_a_port() {
        let mut config = Config::default();
        config.web.bind_addr = config.bus.monitor_addr.clone();
        assert!(check_role(Role::All, &config).is_err());
        assert!(check_role(Role::Web, &config).is_ok());
    }

    #[test]
    fn test_record_store_directory_must_exist() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.aggregator.db_path = dir.path().join("missing").join("records.db");
        assert!(check_role(Role::Web, &config).is_err());
        assert!(check_role(Role::Scorer, &config).is_ok());

        config.aggregator.db_path = dir.path().join("records.db");
        assert!(check_role(Role::Web, &config).is_ok());
    }

    #[test]
    fn test_role_parsing() {
        let parsed = Cli::try_parse_from(["concentration-monitor", "--role", "web"]).unwrap();
        assert_eq!(parsed.role, Role::Web);

        let parsed = Cli::try_parse_from(["concentration-monitor"]).unwrap();
        assert_eq!(parsed.role, Role::All);

        assert!(Cli::try_parse_from(["concentration-monitor", "--role", "capture"]).is_err());
    }

    #[test]
    fn test_roles_build_only_their_tiers() {
        let dir = tempdir().unwrap();

        let scorer =
            ConcentrationMonitor::new(ephemeral_config(dir.path().join("a.db")), Role::Scorer)
                .unwrap();
        assert!(scorer.scorer.is_some());
        assert!(scorer.web.is_none());

        let web = ConcentrationMonitor::new(ephemeral_config(dir.path().join("b.db")), Role::Web)
            .unwrap();
        assert!(web.scorer.is_none());
        assert!(web.web.is_some());
    }

    #[test]
    fn test_start_and_stop_all_tiers() {
        let dir = tempdir().unwrap();
        let mut monitor =
            ConcentrationMonitor::new(ephemeral_config(dir.path().join("c.db")), Role::All)
                .unwrap();
        monitor.start().unwrap();
        assert!(monitor.stream_addr().is_some());

        monitor.shutdown_sender.send(()).unwrap();
        monitor.wait_for_shutdown().unwrap();
        monitor.stop();
        assert!(monitor.stream_addr().is_none());
    }
}
