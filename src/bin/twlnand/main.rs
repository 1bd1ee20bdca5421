//! Binary implementing the CLI in `cli.rs`

use core::convert::TryFrom;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _};
use clap::Parser as _;
use log::{debug, info};

use twlnand::blockdev::SECTOR_SIZE;
use twlnand::config::Config;
use twlnand::crypto::es_block::EsCipher;
use twlnand::identity::{self, AcquiredIdentity, IdentityOrigin};
use twlnand::image;
use twlnand::install::{InstallOutcome, InstallStep, Installer};
use twlnand::keys::{self, derive_es_key};
use twlnand::scratch::ScratchPool;
use twlnand::scripting::{Engine, Mode, Script, ScriptError, Summary};
use twlnand::sector0::PartitionTable;
use twlnand::stage2::Stage2Part;
use twlnand::tmd::DeviceRegion;
use twlnand::util::{parse_hex, to_mebi};
use twlnand::volume::DirVolume;
use twlnand::{DeviceIdentity, Status, Variant};

mod cli;
mod logger;

use cli::{Cli, Command, EsOperation, Format, RegionArg, VariantArg};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = try_main(cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}

/// The library's status code when there is one behind the error.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(error) = err.downcast_ref::<twlnand::Error>() {
        Status::from(error).code()
    } else if let Some(error) = err.downcast_ref::<ScriptError>() {
        Status::from(error).code()
    } else {
        1
    }
}

fn try_main(cli: Cli) -> anyhow::Result<()> {
    logger::Logger::init().map_err(|e| anyhow!("{}", e))?;

    match cli.verbose {
        0 => log::set_max_level(log::LevelFilter::Warn),
        1 => log::set_max_level(log::LevelFilter::Info),
        2 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    };

    let config = match &cli.config {
        Some(path) => Config::try_from(path.as_path())?,
        None => Config::default(),
    };
    debug!("{:?}", &config);

    match &cli.command {
        Command::Keys { variant } => {
            let identity = resolve_identity(&cli, &config, None)?;
            let variant = match variant {
                VariantArg::Dsi => Variant::Dsi,
                VariantArg::ThreeDs => Variant::ThreeDs,
            };
            let material = keys::derive(&identity, variant);
            println!("{} key: {}", variant, hex::encode_upper(material.key));
            println!("counter: {:032X}", material.counter.0);
            println!("ES key:  {}", hex::encode_upper(derive_es_key(&identity.console_id)));
        }

        Command::Check { image, format } => {
            let identity = resolve_identity(&cli, &config, Some(image.as_path()))?;
            let report = image::check_image(image, &identity)?;
            match format {
                Format::Native => {
                    let footer = if report.has_footer { "footer OK" } else { "no footer" };
                    println!("{} image, {} sectors, {}", report.variant, report.sectors, footer);
                    for (i, partition) in report.partitions.iter().enumerate() {
                        println!(
                            "partition {}: type {:#04x}, sector {:#x}, {:#x} sectors ({} MiB)",
                            i,
                            partition.kind,
                            partition.offset,
                            partition.length,
                            to_mebi(partition.length as u64 * SECTOR_SIZE as u64)
                        );
                    }
                }
                Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&report)?),
            }
        }

        Command::Footer { image } => {
            let identity = resolve_identity(&cli, &config, None)?;
            image::append_footer(image, &identity)?;
            println!("footer appended to {}", image.display());
        }

        Command::Decrypt { image, output } => {
            let identity = resolve_identity(&cli, &config, Some(image.as_path()))?;
            decrypt(image, output.as_deref(), &identity)?;
        }

        Command::Script { manifest, root, source, execute, format } => {
            let script = Script::load(manifest)?;
            let source = match source {
                Some(source) => source.clone(),
                None => manifest.parent().map(Path::to_path_buf).unwrap_or_default(),
            };
            let pool = ScratchPool::new(config.scratch.clone());
            let engine = Engine::new(root, source, &pool);

            let dry = engine.run(&script, Mode::DryRun)?;
            print_summary(&dry, *format)?;
            if *execute {
                if !dry.is_clean() {
                    bail!("dry run found {} problem(s), not executing", dry.problems());
                }
                let done = engine.run(&script, Mode::Execute)?;
                print_summary(&done, *format)?;
            }
        }

        Command::Install { tmd, root, region } => {
            let root = root
                .clone()
                .or_else(|| config.install.root.clone())
                .ok_or_else(|| anyhow!("no install root, pass --root or set install.root"))?;
            let identity = resolve_identity(&cli, &config, config.image.path.as_deref())?;
            install(tmd, root, *region, &identity, &config)?;
        }

        Command::Stage2 { image, arm7, key, output, format } => {
            let key = match key {
                Some(key) => parse_hex::<16>(key).ok_or_else(|| anyhow!("--key needs 32 hex digits"))?,
                None => config.boot2.key.ok_or_else(|| anyhow!("no boot2 key, pass --key or set boot2.key"))?,
            };
            let part = if *arm7 { Stage2Part::Arm7 } else { Stage2Part::Arm9 };
            let dump = match output {
                Some(output) => {
                    let mut file = fs::File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
                    image::dump_stage2(image, part, &key, &mut file, |_, _| {})?
                }
                None => image::dump_stage2(image, part, &key, &mut io::sink(), |_, _| {})?,
            };
            match format {
                Format::Native => {
                    let descriptor = &dump.descriptor;
                    println!(
                        "{} stage2: offset {:#x}, size {:#x}, RAM {:#010x}",
                        dump.part, descriptor.offset, descriptor.size, descriptor.ram_address
                    );
                    println!("raw SHA-1: {}", hex::encode_upper(dump.raw_sha1));
                    println!("SHA-1:     {}", hex::encode_upper(dump.sha1));
                }
                Format::Json => println!("{}", serde_json::to_string_pretty(&dump)?),
                Format::Yaml => print!("{}", serde_yaml::to_string(&dump)?),
            }
        }

        Command::Sha1 { file } => {
            let pool = ScratchPool::new(config.scratch.clone());
            let sidecar = image::write_sha1_sidecar(file, &pool)?;
            println!("{}", sidecar.display());
        }

        Command::Es { operation } => {
            let identity = resolve_identity(&cli, &config, None)?;
            let es = EsCipher::new(&derive_es_key(&identity.console_id));
            match operation {
                EsOperation::Decrypt { input, output } => {
                    let stored = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
                    write_output(output.as_deref(), &es.decrypt(&stored)?)?;
                }
                EsOperation::Encrypt { input, output } => {
                    let plain = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
                    write_output(output.as_deref(), &es.encrypt(&plain)?)?;
                }
            }
        }
    }

    Ok(())
}

/// Resolve the identity and say where it came from.
fn resolve_identity(cli: &Cli, config: &Config, image: Option<&Path>) -> anyhow::Result<DeviceIdentity> {
    let acquired = acquire(cli, config, image)?;
    eprintln!(
        "console id {} (from {}), CID {} (from {})",
        hex::encode_upper(acquired.identity.console_id),
        acquired.console_id_origin,
        hex::encode_upper(acquired.identity.cid),
        acquired.cid_origin
    );
    Ok(acquired.identity)
}

fn acquire(cli: &Cli, config: &Config, image: Option<&Path>) -> anyhow::Result<AcquiredIdentity> {
    match (&cli.console_id, &cli.cid) {
        (Some(console_id), Some(cid)) => {
            let identity = DeviceIdentity::from_hex(console_id, cid)?;
            return Ok(AcquiredIdentity::uniform(identity, IdentityOrigin::CommandLine));
        }
        (None, None) => {}
        _ => bail!("--console-id and --cid must be given together"),
    }
    if let Some(identity) = config.identity.identity() {
        return Ok(AcquiredIdentity::uniform(identity, IdentityOrigin::File));
    }

    let dir = cli.identity_dir.clone().or_else(|| config.identity.dir.clone()).unwrap_or_else(|| PathBuf::from("."));
    match identity::acquire(&dir, None) {
        Ok(acquired) => Ok(acquired),
        Err(error) => {
            if let Some(image) = image {
                if let Some(identity) = image::footer_identity(image)? {
                    info!("{}, using the image footer", error);
                    return Ok(AcquiredIdentity::uniform(identity, IdentityOrigin::ImageFooter));
                }
            }
            Err(error.into())
        }
    }
}

fn decrypt(image: &Path, output: Option<&Path>, identity: &DeviceIdentity) -> anyhow::Result<()> {
    let bar = indicatif::ProgressBar::new(0);
    bar.set_style(indicatif::ProgressStyle::with_template("{bar:40} {pos}/{len} sectors ({eta})")?);
    let progress = |done, total| {
        bar.set_length(total);
        bar.set_position(done);
    };

    let sectors = match output {
        Some(output) => image::decrypt_image(image, output, identity, progress)?,
        None => {
            if atty::is(atty::Stream::Stdout) {
                bail!("refusing to write raw data to a terminal, use -o");
            }
            image::decrypt_into(image, &mut io::stdout().lock(), identity, progress)?
        }
    };
    bar.finish_and_clear();
    eprintln!("{} sectors ({} MiB) decrypted", sectors, to_mebi(sectors * SECTOR_SIZE as u64));
    Ok(())
}

fn install(tmd: &Path, root: PathBuf, region: Option<RegionArg>, identity: &DeviceIdentity, config: &Config) -> anyhow::Result<()> {
    let capacity = config
        .install
        .capacity
        .unwrap_or(PartitionTable::reference(Variant::Dsi).main().length as u64 * SECTOR_SIZE as u64);
    let pool = ScratchPool::new(config.scratch.clone());
    let mut installer = Installer::from_config(DirVolume::new(root, capacity), &config.install, &identity.console_id, &pool)?;
    if let Some(region) = region {
        installer = installer.with_region(match region {
            RegionArg::Japan => DeviceRegion::Japan,
            RegionArg::Usa => DeviceRegion::Usa,
            RegionArg::Europe => DeviceRegion::Europe,
            RegionArg::Australia => DeviceRegion::Australia,
            RegionArg::China => DeviceRegion::China,
            RegionArg::Korea => DeviceRegion::Korea,
        });
    }

    match installer.install(tmd) {
        InstallOutcome::Success { title_id, signature_ok, steps, bytes } => {
            println!("installed title {:016x}, {} bytes", title_id, bytes);
            if !signature_ok {
                println!("warning: TMD signature does not verify against the system certificate");
            }
            for step in &steps {
                print_step(step);
            }
            Ok(())
        }
        InstallOutcome::PartialFailure { steps_completed, error } => {
            eprintln!("install stopped after {} verified write(s), nothing was rolled back:", steps_completed.len());
            for step in &steps_completed {
                print_step(step);
            }
            Err(anyhow::Error::new(error).context("install incomplete"))
        }
        InstallOutcome::Aborted { reason } => Err(anyhow::Error::new(reason).context("install aborted, nothing written")),
    }
}

fn print_step(step: &InstallStep) {
    let (what, path) = match step {
        InstallStep::Ticket(path) => ("ticket", path),
        InstallStep::Metadata(path) => ("TMD", path),
        InstallStep::Content(path) => ("content", path),
        InstallStep::Data(path) => ("data", path),
    };
    println!("  {:8} {}", what, path.display());
}

fn print_summary(summary: &Summary, format: Format) -> anyhow::Result<()> {
    match format {
        Format::Native => print!("{}", summary),
        Format::Json => println!("{}", serde_json::to_string_pretty(summary)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(summary)?),
    }
    Ok(())
}

fn write_output(output: Option<&Path>, data: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            if atty::is(atty::Stream::Stdout) {
                bail!("refusing to write raw data to a terminal, use -o");
            }
            io::stdout().write_all(data)?;
        }
    }
    Ok(())
}
