use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use slate::config::{ConfigValue, MemoryConfig, PoolSettings, Settings};
use slate::core::TaskSpec;
use slate::log::{FileLog, LogCategory};
use slate::module::{Interface, ModuleSource, Version};
use slate::{slog_info, Core, Result};

/// Slate - task-graph scheduler with hot-reloadable modules
#[derive(Parser, Debug)]
#[command(name = "slate")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SLATE_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.slate/slate.log unless configured)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the built-in heartbeat module for a number of cycles
    Run {
        /// Settings file (defaults to ~/.slate/slate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Number of cycles to run
        #[arg(long, short = 'n', default_value_t = 3)]
        cycles: u64,

        /// Hot-reload the heartbeat module every N cycles (0 disables)
        #[arg(long, default_value_t = 0)]
        reload_every: u64,
    },

    /// Print the effective settings as TOML
    Config {
        /// Settings file (defaults to ~/.slate/slate.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            cycles,
            reload_every,
        } => run(config, cycles, reload_every, cli.debug),
        Command::Config { config } => show_config(config),
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::load_from(&path)?,
        None => Settings::load()?,
    };
    if settings.pools.is_empty() {
        settings.pools = vec![
            PoolSettings {
                name: "io".to_string(),
                threads: 2,
            },
            PoolSettings {
                name: "cpu".to_string(),
                threads: 4,
            },
        ];
    }
    Ok(settings)
}

fn show_config(path: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(path)?;
    print!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

fn run(path: Option<PathBuf>, cycles: u64, reload_every: u64, debug: bool) -> Result<()> {
    let settings = load_settings(path)?;

    let level = if debug || FileLog::debug_from_env() {
        LogCategory::Debug
    } else {
        settings.log_level
    };
    let log = FileLog::new(settings.effective_log_path()?, level)?;

    let config = MemoryConfig::new();
    settings.seed(&config);

    let core = Core::builder().config(config).log(log).build();
    for pool in &settings.pools {
        core.add_pool(&pool.name, pool.threads)?;
    }

    let pool = if core.pools().contains("cpu") {
        "cpu".to_string()
    } else {
        settings
            .pools
            .first()
            .map(|p| p.name.clone())
            .unwrap_or_default()
    };
    core.load_module(Arc::new(HeartbeatSource::new(pool)))?;
    core.finalize()?;

    for cycle in 1..=cycles {
        let report = core.run_cycle()?;
        println!("{}", serde_json::to_string(&report)?);

        if reload_every > 0 && cycle % reload_every == 0 {
            core.request_reload(HEARTBEAT)?;
        }
    }

    slog_info!(
        core.log(),
        "heartbeat finished at {} after {} ticks",
        core.get_version(HEARTBEAT)?,
        core.config().get_int("heartbeat.ticks", 0)
    );
    core.shutdown();
    Ok(())
}

const HEARTBEAT: &str = "heartbeat";

/// The interface the heartbeat module publishes.
struct Beat {
    label: String,
}

/// Produces a new patch version on every load.
struct HeartbeatSource {
    pool: String,
    loads: AtomicU32,
}

impl HeartbeatSource {
    fn new(pool: String) -> Self {
        Self {
            pool,
            loads: AtomicU32::new(0),
        }
    }
}

/// Version of the `loads`-th heartbeat binding. The patch number carries
/// into the minor one, so versions never go backwards.
fn heartbeat_version(loads: u32) -> Version {
    let minor = u16::try_from(loads >> 16).unwrap_or(u16::MAX);
    Version::new(1, minor, (loads & 0xffff) as u16)
}

impl ModuleSource for HeartbeatSource {
    fn name(&self) -> &str {
        HEARTBEAT
    }

    fn load(&self) -> Result<(Version, Interface)> {
        let loads = self
            .loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or_else(|n| n);
        let version = heartbeat_version(loads);
        let beat = Beat {
            label: format!("beat {}", version),
        };
        Ok((version, Interface::new(beat)))
    }

    fn register_tasks(&self, core: &Core) -> Result<()> {
        core.register_task(
            TaskSpec::once("heartbeat.warmup", self.pool.as_str(), |core| {
                core.config().set("heartbeat.ticks", ConfigValue::Integer(0));
                Ok(())
            })
            .owned_by(HEARTBEAT),
        )?;

        core.register_task(
            TaskSpec::repeated("heartbeat.sample", self.pool.as_str(), |core| {
                let label = core.lookup_interface(HEARTBEAT, |beat: &Beat| beat.label.clone())?;
                core.config().set("heartbeat.label", ConfigValue::Text(label));
                Ok(())
            })
            .depends_on(["heartbeat.warmup"])
            .owned_by(HEARTBEAT),
        )?;

        core.register_task(
            TaskSpec::repeated("heartbeat.tick", self.pool.as_str(), |core| {
                let ticks = core.config().get_int("heartbeat.ticks", 0) + 1;
                core.config().set("heartbeat.ticks", ConfigValue::Integer(ticks));
                slog_info!(
                    core.log(),
                    "{} tick {}",
                    core.config().get_string("heartbeat.label", "beat"),
                    ticks
                );
                Ok(())
            })
            .depends_on(["heartbeat.sample"])
            .owned_by(HEARTBEAT),
        )
    }
}
