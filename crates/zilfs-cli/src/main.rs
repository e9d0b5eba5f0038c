//! zil: command-line access to ZilFS containers
//!
//! Usage:
//!   zil open  <container> [--create]
//!   zil list  <container> [prefix]
//!   zil cat   <container> <path>
//!   zil put   <container> <path> [--from FILE] [--mode 644]
//!   zil mkdir <container> <path>
//!   zil rm    <container> <path>
//!   zil close <container>
//!   zil decoy <path> [--profile noise|flat|adaptive] [--count N]
//!   zil sweep <dir>
//!   zil config show
//!
//! Every command opens the container, does its work and commits before
//! exiting. The passphrase comes from `ZILANT_PASSPHRASE` or a prompt.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use zeroize::Zeroizing;
use zilfs_container::lock::ContainerLock;
use zilfs_container::{
    diff_trees, snapshot, txn, DecoyProfile, ObjectEntry, Session, SessionOptions, TreeChange,
};
use zilfs_core::config::ZilConfig;
use zilfs_core::types::ObjectKind;
use zilfs_core::ZilError;

const ENV_PASSPHRASE: &str = "ZILANT_PASSPHRASE";

#[derive(Parser, Debug)]
#[command(
    name = "zil",
    version,
    about = "ZilFS: encrypted single-file containers"
)]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "ZILFS_CONFIG",
        default_value = "~/.config/zilfs/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "ZILFS_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "ZILFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Unlock a container and print a summary
    Open {
        container: PathBuf,
        /// Create the container if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// List entries under a prefix
    List {
        container: PathBuf,
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Write an object's contents to stdout
    Cat { container: PathBuf, path: String },

    /// Store a file (or stdin) as an object
    Put {
        container: PathBuf,
        path: String,
        /// Read from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
        /// Octal permission bits for the new object
        #[arg(long, value_parser = parse_mode)]
        mode: Option<u16>,
    },

    /// Create a directory
    Mkdir { container: PathBuf, path: String },

    /// Remove a file, symlink or empty directory
    Rm { container: PathBuf, path: String },

    /// Move a file or directory subtree
    Mv {
        container: PathBuf,
        from: String,
        to: String,
    },

    /// Copy a container into `<stem>_<label>.<ext>` under a fresh salt
    Snapshot { container: PathBuf, label: String },

    /// List paths whose content differs between two containers
    Diff { before: PathBuf, after: PathBuf },

    /// Release a container left behind by a crashed process
    Close { container: PathBuf },

    /// Generate decoy containers
    Decoy {
        /// Output file, or output directory with --count
        path: PathBuf,
        /// noise, flat or adaptive (default: [decoy].profile)
        #[arg(long)]
        profile: Option<String>,
        /// Payload size in bytes (default: [decoy].default_size)
        #[arg(long)]
        size: Option<u64>,
        /// Lifetime in seconds (default: [decoy].default_expire_secs)
        #[arg(long)]
        expire: Option<u64>,
        /// Write this many noise decoys into the directory PATH
        #[arg(long)]
        count: Option<usize>,
        /// Seed for the adaptive layout (default: random)
        #[arg(long)]
        seed: Option<u64>,
        /// Seal flat/adaptive decoys under a prompted passphrase
        #[arg(long)]
        with_passphrase: bool,
    },

    /// Delete expired decoys in a directory
    Sweep { dir: PathBuf },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path)?;

    let level = cli.log.as_deref().unwrap_or(&config.log.level);
    let format = match cli.log_format {
        Some(f) => f,
        None => LogFormat::from_str(&config.log.format, true).unwrap_or(LogFormat::Text),
    };
    init_logging(level, &format);
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Open { container, create } => cmd_open(&config, &container, create),
        Commands::List { container, prefix } => cmd_list(&config, &container, &prefix),
        Commands::Cat { container, path } => cmd_cat(&config, &container, &path),
        Commands::Put {
            container,
            path,
            from,
            mode,
        } => cmd_put(&config, &container, &path, from.as_deref(), mode),
        Commands::Mkdir { container, path } => {
            with_session(&config, &container, |s| Ok(s.mkdir(&path)?))
        }
        Commands::Rm { container, path } => {
            with_session(&config, &container, |s| Ok(s.remove(&path)?))
        }
        Commands::Mv {
            container,
            from,
            to,
        } => with_session(&config, &container, |s| Ok(s.rename(&from, &to)?)),
        Commands::Snapshot { container, label } => cmd_snapshot(&config, &container, &label),
        Commands::Diff { before, after } => cmd_diff(&config, &before, &after),
        Commands::Close { container } => cmd_close(&container),
        Commands::Decoy {
            path,
            profile,
            size,
            expire,
            count,
            seed,
            with_passphrase,
        } => cmd_decoy(
            &config,
            &path,
            DecoyArgs {
                profile,
                size,
                expire,
                count,
                seed,
                with_passphrase,
            },
        ),
        Commands::Sweep { dir } => cmd_sweep(&dir),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
    }
}

// ── Setup ─────────────────────────────────────────────────────────────────────

/// Load the config file, or defaults when it does not exist. The bool
/// reports whether a file was found.
fn load_config(path: &Path) -> Result<(ZilConfig, bool)> {
    if !path.exists() {
        return Ok((ZilConfig::default(), false));
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&content)
        .map_err(|e| ZilError::Config(format!("parsing config {}: {e}", path.display())))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Exit status for a failed command: the first [`ZilError`] in the
/// error chain decides, anything else is 1.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ZilError>())
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}

fn parse_mode(s: &str) -> std::result::Result<u16, String> {
    let mode = u16::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))?;
    if mode > 0o7777 {
        return Err(format!("mode {s} out of range"));
    }
    Ok(mode)
}

fn read_passphrase(confirm: bool) -> Result<SecretString> {
    if let Ok(pw) = std::env::var(ENV_PASSPHRASE) {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password("passphrase: ").context("reading passphrase")?;
    if confirm {
        let again = Zeroizing::new(
            rpassword::prompt_password("confirm passphrase: ").context("reading passphrase")?,
        );
        if again.as_str() != pw {
            drop(Zeroizing::new(pw));
            return Err(ZilError::bad_argument("passphrases do not match").into());
        }
    }
    Ok(SecretString::from(pw))
}

fn open_session(config: &ZilConfig, container: &Path, create: bool) -> Result<Session> {
    let passphrase = read_passphrase(create && !container.exists())?;
    SessionOptions::from_config(config)
        .create(create)
        .open(container, &passphrase)
        .with_context(|| format!("opening {}", container.display()))
}

/// Open, run `f`, then commit and close.
fn with_session<T>(
    config: &ZilConfig,
    container: &Path,
    f: impl FnOnce(&Session) -> Result<T>,
) -> Result<T> {
    let session = open_session(config, container, false)?;
    let out = f(&session)?;
    session
        .close()
        .map_err(ZilError::from)
        .with_context(|| format!("committing {}", container.display()))?;
    Ok(out)
}

// ── `zil open` ────────────────────────────────────────────────────────────────

fn cmd_open(config: &ZilConfig, container: &Path, create: bool) -> Result<()> {
    let session = open_session(config, container, create)?;
    let header = session.header();
    let entries = session.list("")?;
    let files = entries.iter().filter(|e| !e.is_dir()).count();
    let bytes: u64 = entries.iter().map(|e| e.size).sum();

    println!("container: {}", container.display());
    println!("format:    v{}", header.version);
    println!("decoy:     {}", if header.is_decoy() { "yes" } else { "no" });
    println!("entries:   {} ({} files)", entries.len(), files);
    println!("payload:   {}", fmt_bytes(bytes));

    session
        .close()
        .map_err(ZilError::from)
        .with_context(|| format!("committing {}", container.display()))
}

// ── `zil list` / `zil cat` / `zil put` ────────────────────────────────────────

fn cmd_list(config: &ZilConfig, container: &Path, prefix: &str) -> Result<()> {
    let entries = with_session(config, container, |s| Ok(s.list(prefix)?))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for entry in &entries {
        writeln!(out, "{}", format_entry(entry))?;
    }
    Ok(())
}

fn format_entry(entry: &ObjectEntry) -> String {
    let kind = match entry.kind {
        ObjectKind::Directory => 'd',
        ObjectKind::Symlink => 'l',
        ObjectKind::File | ObjectKind::Decoy => '-',
    };
    format!(
        "{kind}{:04o} {:>10} {}",
        entry.mode, entry.size, entry.path
    )
}

fn cmd_cat(config: &ZilConfig, container: &Path, path: &str) -> Result<()> {
    with_session(config, container, |s| {
        let data = s.read(path)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        out.write_all(data.as_slice())?;
        out.flush()?;
        Ok(())
    })
}

fn cmd_put(
    config: &ZilConfig,
    container: &Path,
    path: &str,
    from: Option<&Path>,
    mode: Option<u16>,
) -> Result<()> {
    let data = Zeroizing::new(match from {
        Some(file) => {
            std::fs::read(file).with_context(|| format!("reading {}", file.display()))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut buf)
                .context("reading stdin")?;
            buf
        }
    });
    with_session(config, container, |s| {
        s.write(path, &data)?;
        if let Some(mode) = mode {
            s.set_mode(path, mode)?;
        }
        Ok(())
    })?;
    tracing::info!(path, bytes = data.len(), "object stored");
    Ok(())
}

// ── `zil snapshot` / `zil diff` ───────────────────────────────────────────────

fn cmd_snapshot(config: &ZilConfig, container: &Path, label: &str) -> Result<()> {
    let passphrase = read_passphrase(false)?;
    let options = SessionOptions::from_config(config);
    let session = options
        .open(container, &passphrase)
        .with_context(|| format!("opening {}", container.display()))?;
    let out = snapshot(&session, label, &options, &passphrase)
        .with_context(|| format!("snapshotting {}", container.display()))?;
    session.close().map_err(ZilError::from)?;
    println!("{}", out.display());
    Ok(())
}

/// Both containers are unlocked with the same passphrase.
fn cmd_diff(config: &ZilConfig, before: &Path, after: &Path) -> Result<()> {
    let passphrase = read_passphrase(false)?;
    let options = SessionOptions::from_config(config);
    let open = |path: &Path| {
        options
            .open(path, &passphrase)
            .with_context(|| format!("opening {}", path.display()))
    };
    let (old, new) = (open(before)?, open(after)?);
    for change in diff_trees(&old, &new)? {
        println!("{}", format_change(&change));
    }
    Ok(())
}

fn format_change(change: &TreeChange) -> String {
    let mark = match (change.before, change.after) {
        (None, _) => '+',
        (_, None) => '-',
        _ => '~',
    };
    format!("{mark} {}", change.path)
}

// ── `zil close` ───────────────────────────────────────────────────────────────

/// Clear what a crashed process left next to the container: staging
/// files and the lock sidecar.
fn cmd_close(container: &Path) -> Result<()> {
    if !container.exists() {
        return Err(ZilError::not_found(container.display().to_string()).into());
    }
    let lock = ContainerLock::acquire(container)
        .with_context(|| format!("{} is open in another process", container.display()))?;
    let swept = txn::sweep_stale(container)?;
    lock.remove()?;
    println!(
        "{}: released ({} staging file(s) removed)",
        container.display(),
        swept
    );
    Ok(())
}

// ── `zil decoy` / `zil sweep` ─────────────────────────────────────────────────

struct DecoyArgs {
    profile: Option<String>,
    size: Option<u64>,
    expire: Option<u64>,
    count: Option<usize>,
    seed: Option<u64>,
    with_passphrase: bool,
}

fn cmd_decoy(config: &ZilConfig, path: &Path, args: DecoyArgs) -> Result<()> {
    let size = args.size.unwrap_or(config.decoy.default_size);
    let expire = args.expire.unwrap_or(config.decoy.default_expire_secs);

    if let Some(count) = args.count {
        let written = zilfs_container::generate_decoys(path, count, size, expire)?;
        for p in &written {
            println!("{}", p.display());
        }
        return Ok(());
    }

    let seed = match args.seed {
        Some(seed) => seed,
        None => u64::from_le_bytes(zilfs_crypto::EntropySource::global().array()?),
    };
    let name = args.profile.as_deref().unwrap_or(&config.decoy.profile);
    let profile = DecoyProfile::from_name(name, size, seed)?;
    let passphrase = if args.with_passphrase {
        Some(read_passphrase(true)?)
    } else {
        None
    };
    zilfs_container::generate_decoy_with(path, &profile, expire, passphrase.as_ref())
        .with_context(|| format!("writing decoy {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_sweep(dir: &Path) -> Result<()> {
    let removed = zilfs_container::sweep_expired(dir)
        .with_context(|| format!("sweeping {}", dir.display()))?;
    println!("{removed} expired decoy(s) removed");
    Ok(())
}

// ── `zil config show` ─────────────────────────────────────────────────────────

fn cmd_config_show(config: &ZilConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let mut effective = config.clone();
    effective.kdf = effective.kdf.with_env_overrides();
    let rendered = toml::to_string_pretty(&effective).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Utilities ─────────────────────────────────────────────────────────────────

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
