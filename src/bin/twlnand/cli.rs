//! Command-line interface to this crate's functionality

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

const ABOUT: &str = "
twlnand works on DSi-family NAND images: it derives the console-unique keys,
checks and decrypts images, runs .nfs install manifests and installs titles.

Identifiers come from --console-id/--cid, the configuration file, the
console_id.txt and cid.txt files, or the image footer, in that order.

Use -h for short descriptions and --help for more details
";

#[derive(Debug, Parser)]
#[command(name = "twlnand", version, about = "NAND crypto and title install toolkit", long_about = ABOUT)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Sets the level of verbosity (use multiple times to increase: -v = INFO, -vv = DEBUG, -vvv = TRACE)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (.toml, .yaml or .yml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Console id (16 hex digits)
    #[arg(long, global = true, value_name = "HEX")]
    pub console_id: Option<String>,

    /// eMMC CID (32 hex digits)
    #[arg(long, global = true, value_name = "HEX")]
    pub cid: Option<String>,

    /// Directory holding console_id.txt and cid.txt
    #[arg(long, global = true, value_name = "DIR")]
    pub identity_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Format {
    Native,
    Json,
    Yaml,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum VariantArg {
    Dsi,
    #[value(name = "3ds")]
    ThreeDs,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum RegionArg {
    Japan,
    Usa,
    Europe,
    Australia,
    China,
    Korea,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the derived sector key, base counter and ES key
    Keys {
        #[arg(long, value_enum, default_value = "dsi")]
        variant: VariantArg,
    },

    /// Validate the footer and sector 0 of an image
    Check {
        image: PathBuf,
        #[arg(short, long, value_enum, default_value = "native")]
        format: Format,
    },

    /// Append the identity footer to an image that has none
    Footer { image: PathBuf },

    /// Decrypt a whole image
    Decrypt {
        image: PathBuf,
        /// Output file, stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run an .nfs manifest, dry run first
    Script {
        manifest: PathBuf,
        /// Mounted NAND partition the manifest installs into
        #[arg(long)]
        root: PathBuf,
        /// Where the manifest's files are read from, defaults to the manifest's directory
        #[arg(long)]
        source: Option<PathBuf>,
        /// Execute after a clean dry run
        #[arg(long)]
        execute: bool,
        #[arg(short, long, value_enum, default_value = "native")]
        format: Format,
    },

    /// Install the title described by a TMD
    Install {
        tmd: PathBuf,
        /// Mounted NAND partition, overrides install.root
        #[arg(long)]
        root: Option<PathBuf>,
        /// Device region, overrides install.region
        #[arg(long, value_enum)]
        region: Option<RegionArg>,
    },

    /// Decrypt a stage2 loader blob and print its digests
    Stage2 {
        image: PathBuf,
        /// The ARM7 blob instead of the ARM9 one
        #[arg(long)]
        arm7: bool,
        /// boot2 key (32 hex digits), overrides boot2.key
        #[arg(long, value_name = "HEX")]
        key: Option<String>,
        /// Output file, digests only if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "native")]
        format: Format,
    },

    /// Write a `<file>.sha1` line usable in manifests
    Sha1 { file: PathBuf },

    /// Ticket ES block transform
    Es {
        #[command(subcommand)]
        operation: EsOperation,
    },
}

#[derive(Debug, Subcommand)]
pub enum EsOperation {
    /// Authenticate and decrypt a stored ticket
    Decrypt {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Seal a plain ticket for storage
    Encrypt {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
