//! sealpack: multi-recipient file encryption CLI
//!
//! Commands:
//!   encrypt <input>          - seal a file for one or more recipients
//!   decrypt <input>          - open an envelope, optionally a byte range
//!   reencrypt <input>        - re-seal the header for new recipients
//!   inspect <input>          - describe the header without decrypting
//!   keygen --name <name>     - create an X25519 key pair
//!   config show              - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sealpack_core::config::SealConfig;
use sealpack_core::{SealError, SealResult};
use sealpack_crypto::{
    inspect_header, load_private_key, load_public_key, save_private_key, save_public_key,
    ByteRange, DecryptOptions, EncryptOptions, KdfParams, KeyPair, Pipeline,
    PrivateKey, PublicKey, ReencryptOptions,
};

const PASSPHRASE_ENV: &str = "SEALPACK_PASSPHRASE";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sealpack",
    version,
    about = "Authenticated, chunked, multi-recipient file encryption",
    long_about = "sealpack: encrypt files for X25519 recipients, decrypt, re-key and inspect envelopes"
)]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "SEALPACK_CONFIG",
        default_value = "~/.config/sealpack/config.toml"
    )]
    config: PathBuf,

    /// Log filter, e.g. "debug" or "sealpack_crypto=trace" (overrides [logging].level)
    #[arg(long, env = "SEALPACK_LOG", global = true)]
    log: Option<String>,

    /// Log output format (overrides [logging].format)
    #[arg(long, value_enum, env = "SEALPACK_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file for one or more recipients
    Encrypt {
        /// File to encrypt
        input: PathBuf,
        /// Recipient public key file (repeatable; default: [keys].public_key)
        #[arg(long = "recipient", short = 'r')]
        recipients: Vec<PathBuf>,
        /// Seal header packets with this private key instead of an ephemeral one
        #[arg(long)]
        sender_key: Option<PathBuf>,
        /// Output path (default: input + encrypted suffix)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Plaintext bytes per chunk (overrides [crypto].chunk_size)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Parallel chunk encryption workers (overrides [crypto].workers)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Decrypt an envelope
    Decrypt {
        /// Envelope to decrypt
        input: PathBuf,
        /// Private key file (default: [keys].private_key)
        #[arg(long = "key", short = 'k')]
        key: Option<PathBuf>,
        /// Only accept header packets written by this public key
        #[arg(long)]
        sender: Option<PathBuf>,
        /// Output path (default: input without the encrypted suffix)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Skip this many plaintext bytes
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Emit at most this many plaintext bytes
        #[arg(long)]
        span: Option<u64>,
    },

    /// Re-seal an envelope's header for new recipients, copying the body
    Reencrypt {
        /// Envelope to re-key
        input: PathBuf,
        /// Private key that opens the existing header
        #[arg(long = "key", short = 'k')]
        key: Option<PathBuf>,
        /// New recipient public key file (repeatable)
        #[arg(long = "recipient", short = 'r', required = true)]
        recipients: Vec<PathBuf>,
        /// Seal the new packets with this private key instead of an ephemeral one
        #[arg(long)]
        sender_key: Option<PathBuf>,
        /// Output path (default: <input>.rekeyed + encrypted suffix)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Show an envelope's header without decrypting anything
    Inspect {
        /// Envelope to inspect
        input: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Generate an X25519 key pair
    Keygen {
        /// Key name: writes <name>_private.sec and <name>_public.pub
        #[arg(long)]
        name: String,
        /// Directory for the key files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Store the private key without a passphrase
        #[arg(long)]
        no_passphrase: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<SealError>())
            .map(|seal| seal.kind().exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path)?;

    let level = cli.log.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(level, format);

    match cli.command {
        Commands::Encrypt {
            input,
            recipients,
            sender_key,
            output,
            chunk_size,
            workers,
        } => {
            cmd_encrypt(
                &config,
                &input,
                &recipients,
                sender_key.as_deref(),
                output.as_deref(),
                chunk_size,
                workers,
            )
            .await
        }
        Commands::Decrypt {
            input,
            key,
            sender,
            output,
            offset,
            span,
        } => {
            let range = (offset > 0 || span.is_some()).then_some(ByteRange { offset, span });
            cmd_decrypt(&config, &input, key.as_deref(), sender.as_deref(), output.as_deref(), range)
                .await
        }
        Commands::Reencrypt {
            input,
            key,
            recipients,
            sender_key,
            output,
        } => {
            cmd_reencrypt(
                &config,
                &input,
                key.as_deref(),
                &recipients,
                sender_key.as_deref(),
                output.as_deref(),
            )
            .await
        }
        Commands::Inspect { input, json } => cmd_inspect(&input, json),
        Commands::Keygen {
            name,
            output_dir,
            no_passphrase,
        } => cmd_keygen(&config, &name, &output_dir, no_passphrase),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

// ── Config + logging ──────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<SealConfig> {
    SealConfig::from_file(path).with_context(|| format!("loading config: {}", path.display()))
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

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

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

// ── Keys and passphrases ──────────────────────────────────────────────────────

fn read_passphrase(prompt: &str) -> Option<SecretString> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Some(SecretString::from(value));
    }
    rpassword::prompt_password(prompt).ok().map(SecretString::from)
}

fn new_passphrase() -> Result<SecretString> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(SecretString::from(value));
    }
    let first = SecretString::from(
        rpassword::prompt_password("New passphrase (empty for none): ")
            .context("reading passphrase")?,
    );
    let second = SecretString::from(
        rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?,
    );
    if first.expose_secret() != second.expose_secret() {
        return Err(SealError::Configuration("passphrases do not match".into()).into());
    }
    Ok(first)
}

fn recipient_keys(paths: &[PathBuf], config: &SealConfig) -> Result<Vec<PublicKey>> {
    let paths: Vec<PathBuf> = if paths.is_empty() {
        config.keys.public_key.iter().cloned().collect()
    } else {
        paths.to_vec()
    };
    if paths.is_empty() {
        return Err(SealError::Configuration(
            "no recipients: pass -r <public key> or set [keys].public_key".into(),
        )
        .into());
    }

    paths
        .iter()
        .map(|p| {
            let p = expand_tilde(p);
            load_public_key(&p).with_context(|| format!("loading recipient key {}", p.display()))
        })
        .collect()
}

fn private_key(path: Option<&Path>, config: &SealConfig) -> Result<PrivateKey> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| config.keys.private_key.clone())
        .ok_or_else(|| {
            SealError::Configuration(
                "no private key: pass -k <private key> or set [keys].private_key".into(),
            )
        })?;
    let path = expand_tilde(&path);
    let prompt = format!("Passphrase for {}: ", path.display());
    load_private_key(&path, || read_passphrase(&prompt))
        .with_context(|| format!("loading private key {}", path.display()))
}

fn validate_key_name(name: &str) -> SealResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SealError::Configuration(format!(
            "invalid key name {name:?}: use letters, digits and underscores"
        )));
    }
    Ok(())
}

// ── Output paths ──────────────────────────────────────────────────────────────

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

fn strip_suffix(path: &Path, suffix: &str) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    match name.strip_suffix(suffix) {
        Some(stem) if !stem.is_empty() => Some(path.with_file_name(stem)),
        _ => None,
    }
}

fn default_decrypt_output(input: &Path, suffix: &str) -> PathBuf {
    strip_suffix(input, suffix).unwrap_or_else(|| append_suffix(input, ".dec"))
}

fn default_reencrypt_output(input: &Path, suffix: &str) -> PathBuf {
    let base = strip_suffix(input, suffix).unwrap_or_else(|| input.to_path_buf());
    append_suffix(&append_suffix(&base, ".rekeyed"), suffix)
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ── Pipeline runner ───────────────────────────────────────────────────────────

/// Run one pipeline operation from `input` into a staging file next to
/// `output`, on a blocking thread, with Ctrl-C wired to the cancel token.
///
/// The staging file only replaces `output` after the operation succeeded;
/// on any failure it is deleted, so partial plaintext never lands at
/// `output`.
async fn run_pipeline<F>(input: &Path, output: &Path, prefix: &str, op: F) -> Result<u64>
where
    F: FnOnce(&mut Pipeline, BufReader<File>, BufWriter<File>) -> SealResult<u64>
        + Send
        + 'static,
{
    let file = open_input(input)?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    if output.exists() {
        return Err(SealError::Configuration(format!(
            "refusing to overwrite {}",
            output.display()
        ))
        .into());
    }

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let staging = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("creating staging file in {}", dir.display()))?;
    let writer = BufWriter::new(
        staging
            .as_file()
            .try_clone()
            .context("duplicating staging file handle")?,
    );
    let reader = BufReader::new(file);

    let pb = make_progress_bar(size, prefix);
    let cancel = CancellationToken::new();
    let finished = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        let finished = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        tracing::warn!("interrupt received, cancelling");
                        cancel.cancel();
                    }
                }
            }
        })
    };

    let bar = pb.clone();
    let mut pipeline = Pipeline::new()
        .with_cancel(cancel)
        .with_size_hint(size)
        .with_progress(Box::new(move |done: u64, _total: u64, msg: &str| {
            bar.set_position(done);
            bar.set_message(msg.to_string());
        }));

    let result = tokio::task::spawn_blocking(move || op(&mut pipeline, reader, writer))
        .await
        .context("pipeline task failed")?;
    finished.cancel();
    let _ = ctrl_c.await;

    match result {
        Ok(bytes) => {
            pb.finish_and_clear();
            staging.as_file().sync_all().context("syncing output")?;
            staging
                .persist_noclobber(output)
                .map_err(|e| e.error)
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::debug!(output = %output.display(), bytes, "output persisted");
            Ok(bytes)
        }
        Err(e) => {
            pb.abandon();
            Err(e.into())
        }
    }
}

fn open_input(path: &Path) -> Result<File> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SealError::Configuration(
            format!("input not found: {}", path.display()),
        )
        .into()),
        Err(e) => Err(e).with_context(|| format!("opening {}", path.display())),
    }
}

// ── `sealpack encrypt` ────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &SealConfig,
    input: &Path,
    recipients: &[PathBuf],
    sender_key: Option<&Path>,
    output: Option<&Path>,
    chunk_size: Option<u32>,
    workers: Option<usize>,
) -> Result<()> {
    let recipients = recipient_keys(recipients, config)?;
    let mut opts = EncryptOptions::from(&config.crypto);
    if let Some(n) = chunk_size {
        opts.chunk_size = n;
    }
    if let Some(n) = workers {
        opts.workers = n;
    }
    opts.sender = sender_key.map(|p| private_key(Some(p), config)).transpose()?;

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| append_suffix(input, &config.output.encrypted_suffix));
    let count = recipients.len();

    let bytes = run_pipeline(input, &output, "encrypt", move |pipeline, reader, writer| {
        pipeline.encrypt(reader, writer, &recipients, &opts)
    })
    .await?;

    println!("Encrypted: {} → {}", input.display(), output.display());
    println!("  recipients: {count}");
    println!("  size:       {}", fmt_bytes(bytes));
    Ok(())
}

// ── `sealpack decrypt` ────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &SealConfig,
    input: &Path,
    key: Option<&Path>,
    sender: Option<&Path>,
    output: Option<&Path>,
    range: Option<ByteRange>,
) -> Result<()> {
    let private = private_key(key, config)?;
    let expected_sender = sender
        .map(|p| {
            let p = expand_tilde(p);
            load_public_key(&p).with_context(|| format!("loading sender key {}", p.display()))
        })
        .transpose()?;
    let opts = DecryptOptions {
        expected_sender,
        range,
    };

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_decrypt_output(input, &config.output.encrypted_suffix));

    let bytes = run_pipeline(input, &output, "decrypt", move |pipeline, reader, writer| {
        pipeline.decrypt(reader, writer, &private, &opts)
    })
    .await?;

    println!("Decrypted: {} → {}", input.display(), output.display());
    println!("  size: {}", fmt_bytes(bytes));
    Ok(())
}

// ── `sealpack reencrypt` ──────────────────────────────────────────────────────

async fn cmd_reencrypt(
    config: &SealConfig,
    input: &Path,
    key: Option<&Path>,
    recipients: &[PathBuf],
    sender_key: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let private = private_key(key, config)?;
    let recipients = recipient_keys(recipients, config)?;
    let opts = ReencryptOptions {
        sender: sender_key.map(|p| private_key(Some(p), config)).transpose()?,
        expected_sender: None,
    };

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_reencrypt_output(input, &config.output.encrypted_suffix));
    let count = recipients.len();

    run_pipeline(input, &output, "reencrypt", move |pipeline, reader, writer| {
        pipeline.reencrypt(reader, writer, &private, &recipients, &opts)
    })
    .await?;

    println!("Re-encrypted: {} → {}", input.display(), output.display());
    println!("  recipients: {count}");
    Ok(())
}

// ── `sealpack inspect` ────────────────────────────────────────────────────────

fn cmd_inspect(input: &Path, json: bool) -> Result<()> {
    let mut reader = BufReader::new(open_input(input)?);
    let summary = inspect_header(&mut reader)
        .with_context(|| format!("reading header of {}", input.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serializing header summary")?
        );
        return Ok(());
    }

    println!("Envelope: {}", input.display());
    println!("  version: {}", summary.version);
    println!("  packets: {}", summary.packet_count);
    for (i, packet) in summary.packets.iter().enumerate() {
        println!(
            "  [{i}] {}  writer={}  sealed={} B",
            packet.method, packet.writer_public_key, packet.sealed_len
        );
    }
    Ok(())
}

// ── `sealpack keygen` ─────────────────────────────────────────────────────────

fn cmd_keygen(config: &SealConfig, name: &str, output_dir: &Path, no_passphrase: bool) -> Result<()> {
    validate_key_name(name)?;
    let dir = expand_tilde(output_dir);
    let private_path = dir.join(format!("{name}_private.sec"));
    let public_path = dir.join(format!("{name}_public.pub"));
    for path in [&private_path, &public_path] {
        if path.exists() {
            return Err(SealError::Configuration(format!(
                "refusing to overwrite {}",
                path.display()
            ))
            .into());
        }
    }

    let passphrase = if no_passphrase {
        None
    } else {
        Some(new_passphrase()?)
    };
    if passphrase
        .as_ref()
        .map_or(true, |p| p.expose_secret().is_empty())
    {
        tracing::warn!(name, "private key will be stored without a passphrase");
    }

    let pair = KeyPair::generate();
    save_private_key(
        &private_path,
        &pair.private,
        passphrase.as_ref(),
        &KdfParams::from(&config.crypto),
    )
    .with_context(|| format!("writing {}", private_path.display()))?;
    save_public_key(&public_path, &pair.public)
        .with_context(|| format!("writing {}", public_path.display()))?;

    println!("Generated key pair '{name}'");
    println!("  private: {}", private_path.display());
    println!("  public:  {}", public_path.display());
    println!("  key:     {}", pair.public);
    Ok(())
}

// ── `sealpack config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &SealConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

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
