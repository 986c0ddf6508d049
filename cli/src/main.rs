use clap::{Parser, Subcommand};
use firmctl_core::{Config, FirmctlError, Verification};
use firmctl_filesystems::{BackendChoice, FileKind, Image};
use log::debug;
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "firmctl")]
#[command(about = "Inspect and extract signed firmware update images", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Partition number holding the root filesystem
    #[arg(short, long, global = true)]
    partition: Option<usize>,

    /// Hex-encoded Ed25519 public key for signed containers
    #[arg(long, global = true)]
    public_key: Option<String>,

    /// Continue when a signed container has no key to check it against
    #[arg(long, global = true)]
    allow_unverified: bool,

    /// Serve reads from a directory where the root filesystem is already mounted
    #[arg(long, global = true)]
    host_mount: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory inside the image
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        /// Show inode numbers and entry kinds
        #[arg(short, long)]
        long: bool,
    },
    /// Write a file from the image to stdout
    Cat { image: PathBuf, path: String },
    /// Recursively list everything below a directory
    Walk {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Verify the container and write its payload to a file
    Extract {
        image: PathBuf,
        output: PathBuf,
        /// Expected SHA-256 of the payload, in hex
        #[arg(long)]
        expect: Option<String>,
    },
    /// Print container, filesystem and release details as JSON
    Info { image: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("firmctl: {:#}", e);
        let code = e
            .downcast_ref::<FirmctlError>()
            .map(FirmctlError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn load_config(cli: &Cli) -> Result<Config, FirmctlError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if cli.partition.is_some() {
        config.partition = cli.partition;
    }
    if cli.public_key.is_some() {
        config.public_key = cli.public_key.clone();
    }
    config.allow_missing_key |= cli.allow_unverified;
    config.validate()?;
    Ok(config)
}

fn kind_tag(kind: FileKind) -> char {
    match kind {
        FileKind::Directory => 'd',
        FileKind::Regular => '-',
        FileKind::Symlink => 'l',
        FileKind::CharDevice => 'c',
        FileKind::BlockDevice => 'b',
        FileKind::Fifo => 'p',
        FileKind::Socket => 's',
        FileKind::Unknown => '?',
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let backend = match &cli.host_mount {
        Some(dir) => BackendChoice::HostMount(dir.clone()),
        None => BackendChoice::DirectParse,
    };

    match cli.command {
        Commands::Ls { image, path, long } => {
            let image = Image::open(&image, &config)?;
            let ops = image.ops(&backend)?;
            debug!("Listing {} through the {} backend", path, ops.backend_name());
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for entry in ops.list_directory(&path)? {
                if long {
                    let inode = entry.inode.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string());
                    writeln!(out, "{} {:>8} {}", kind_tag(entry.kind), inode, entry.name)?;
                } else {
                    writeln!(out, "{}", entry.name)?;
                }
            }
        }
        Commands::Cat { image, path } => {
            let image = Image::open(&image, &config)?;
            let mut reader = image.ops(&backend)?.read_file(&path)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut reader, &mut out).map_err(FirmctlError::from_io)?;
            out.flush()?;
        }
        Commands::Walk { image, path } => {
            let image = Image::open(&image, &config)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for entry in image.reader().walk(&path)? {
                writeln!(out, "{} {}", kind_tag(entry.kind), entry.path)?;
            }
        }
        Commands::Extract {
            image,
            output,
            expect,
        } => {
            let report = firmctl_filesystems::extract(&image, &output, &config)?;
            if let Some(expected) = expect {
                report.verify(&expected)?;
            }
            println!("{}  {}", report.digest, output.display());
            eprintln!("{} bytes written", report.bytes_written);
        }
        Commands::Info { image } => {
            let image = Image::open(&image, &config)?;
            let header = image.container().header();
            let verification = match image.container().verification() {
                Verification::Verified(kind) => kind.name().to_string(),
                Verification::Unverified => "unverified".to_string(),
            };
            let info = json!({
                "container": {
                    "version": header.version,
                    "device_id": header.device_id,
                    "payload_len": header.payload_len,
                    "integrity": header.integrity_kind.name(),
                    "verification": verification,
                },
                "root": image.root_source().to_string(),
                "filesystem": image.reader().statfs(),
                "release": image.release_info()?,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}
