//! Title installation.
//!
//! One pass per title: load the TMD, check its signature (reported, not enforced), check the
//! application's digest and region, then forge a ticket and write everything to the mounted
//! volume, re-hashing each file right after writing it.
//!
//! Nothing is written until every check has passed and the volume has room. Once writing has
//! started, a failure leaves the files already written in place; the outcome says how far the
//! install got.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::es_block::EsCipher;
use crate::crypto::{sha1, sha1_file, SHA1_LEN};
use crate::error::{Error, Result};
use crate::keys::derive_es_key;
use crate::pki::Certificate;
use crate::scratch::ScratchPool;
use crate::status::Status;
use crate::ticket::{TicketTemplate, STORED_TICKET_SIZE};
use crate::tmd::{AppHeader, DeviceRegion, Region, TitleMetadata, TMD_SIZE};
use crate::util::{is_default, to_mebi};
use crate::volume::Volume;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
#[serde(default)]
pub struct InstallConfig {
    /// Where the main partition is mounted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Certificate store, relative to the root.
    pub cert_store: PathBuf,
    pub cert_offset: u64,
    pub cert_issuer: String,
    pub cert_name: String,
    /// Directory searched for a ticket template, relative to the root.
    pub ticket_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<DeviceRegion>,
    /// Bytes that must stay free after the install.
    pub reserve: u64,
    /// Size of the mounted partition. Defaults to the size of partition 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    /// Refuse titles whose TMD signature does not verify.
    #[serde(skip_serializing_if = "is_default")]
    pub strict_signature: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root: None,
            cert_store: PathBuf::from("sys/cert.sys"),
            cert_offset: 0x700,
            cert_issuer: "Root-CA00000001".into(),
            cert_name: "CP00000007".into(),
            ticket_dir: PathBuf::from("ticket/00030004"),
            region: None,
            reserve: 1 << 20,
            capacity: None,
            strict_signature: false,
        }
    }
}

/// A write that completed and verified.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStep {
    Ticket(PathBuf),
    Metadata(PathBuf),
    Content(PathBuf),
    Data(PathBuf),
}

#[derive(Debug)]
pub enum InstallOutcome {
    Success {
        title_id: u64,
        /// Whether the TMD signature verified against the system certificate.
        signature_ok: bool,
        steps: Vec<InstallStep>,
        bytes: u64,
    },
    /// Writing started and then failed. Earlier steps stay on the volume.
    PartialFailure { steps_completed: Vec<InstallStep>, error: Error },
    /// Nothing was written.
    Aborted { reason: Error },
}

impl InstallOutcome {
    pub fn status(&self) -> Status {
        match self {
            InstallOutcome::Success { .. } => Status::Ok,
            InstallOutcome::PartialFailure { error, .. } => Status::from(error),
            InstallOutcome::Aborted { reason } => Status::from(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstallOutcome::Success { .. })
    }
}

/// Where one title's files go below the volume root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TitleLayout {
    pub ticket: PathBuf,
    pub content_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl TitleLayout {
    pub fn new(root: &Path, title_id: u64) -> Self {
        let (hi, lo) = (format!("{:08x}", (title_id >> 32) as u32), format!("{:08x}", title_id as u32));
        let title = root.join("title").join(&hi).join(&lo);
        Self {
            ticket: root.join("ticket").join(&hi).join(format!("{}.tik", lo)),
            content_dir: title.join("content"),
            data_dir: title.join("data"),
        }
    }

    pub fn tmd(&self) -> PathBuf {
        self.content_dir.join("title.tmd")
    }
}

/// Everything checked before the first write.
struct Plan {
    tmd: TitleMetadata,
    signature_ok: bool,
    app: PathBuf,
    data: Vec<(PathBuf, [u8; SHA1_LEN])>,
    layout: TitleLayout,
    ticket: Vec<u8>,
    bytes: u64,
}

pub struct Installer<'a, V> {
    volume: V,
    certificate: Certificate,
    template: TicketTemplate,
    es: EsCipher,
    region: Option<Region>,
    reserve: u64,
    strict_signature: bool,
    pool: &'a ScratchPool,
}

impl<'a, V: Volume> Installer<'a, V> {
    pub fn new(volume: V, certificate: Certificate, template: TicketTemplate, es: EsCipher, pool: &'a ScratchPool) -> Self {
        Self {
            volume,
            certificate,
            template,
            es,
            region: None,
            reserve: InstallConfig::default().reserve,
            strict_signature: false,
            pool,
        }
    }

    /// Load the certificate and ticket template from the volume as configured.
    pub fn from_config(volume: V, config: &InstallConfig, console_id: &[u8; 8], pool: &'a ScratchPool) -> Result<Self> {
        let certificate = Certificate::load(&volume.root().join(&config.cert_store), config.cert_offset)?;
        certificate.check_names(&config.cert_issuer, &config.cert_name)?;
        let es = EsCipher::new(&derive_es_key(console_id));
        let template = TicketTemplate::discover(&volume.root().join(&config.ticket_dir), &es)?;

        let mut installer = Self::new(volume, certificate, template, es, pool);
        installer.region = config.region.map(DeviceRegion::flag);
        installer.reserve = config.reserve;
        installer.strict_signature = config.strict_signature;
        Ok(installer)
    }

    pub fn with_region(mut self, region: DeviceRegion) -> Self {
        self.region = Some(region.flag());
        self
    }

    pub fn with_reserve(mut self, reserve: u64) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    /// Install the title described by the TMD at `tmd_path`.
    ///
    /// The application is expected next to the TMD, auxiliary data files in `../data`.
    pub fn install(&self, tmd_path: &Path) -> InstallOutcome {
        let plan = match self.plan(tmd_path) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!("install aborted: {}", reason);
                return InstallOutcome::Aborted { reason };
            }
        };
        let mut steps = Vec::new();
        match self.write(&plan, &mut steps) {
            Ok(()) => {
                info!("installed title {:016x}, {} MiB", plan.tmd.title_id, to_mebi(plan.bytes));
                InstallOutcome::Success { title_id: plan.tmd.title_id, signature_ok: plan.signature_ok, steps, bytes: plan.bytes }
            }
            Err(error) => {
                error!("install failed after {} verified write(s), not rolled back: {}", steps.len(), error);
                InstallOutcome::PartialFailure { steps_completed: steps, error }
            }
        }
    }

    fn plan(&self, tmd_path: &Path) -> Result<Plan> {
        let tmd = TitleMetadata::load(tmd_path)?;
        let signature_ok = match tmd.verify_signature(&self.certificate) {
            Ok(()) => true,
            Err(e) if self.strict_signature => return Err(e),
            Err(e) => {
                warn!("TMD signature does not verify ({}), continuing", e);
                false
            }
        };

        let source_dir = tmd_path.parent().unwrap_or_else(|| Path::new("."));
        let app = source_dir.join(tmd.content.file_name());
        let (digest, app_size) = self.hash(&app)?;
        if digest != tmd.content.sha1 {
            debug!("{}: digest {}, TMD records {}", app.display(), hex::encode(digest), hex::encode(tmd.content.sha1));
            return Err(Error::DigestMismatch(app));
        }
        if app_size != tmd.content.size {
            warn!("{} is {} bytes, TMD records {}", app.display(), app_size, tmd.content.size);
        }
        self.check_header(&app, &tmd)?;

        let data = self.data_files(&source_dir.join("..").join("data"))?;
        let data_size: u64 = data.iter().map(|(path, _)| fs::metadata(path).map(|m| m.len()).unwrap_or(0)).sum();

        let layout = TitleLayout::new(self.volume.root(), tmd.title_id);
        if layout.ticket.exists() {
            return Err(Error::AlreadyExists(layout.ticket));
        }

        let bytes = (STORED_TICKET_SIZE + TMD_SIZE) as u64 + app_size + data_size;
        let available = self.volume.available_space()?;
        let needed = bytes + self.reserve;
        info!("{} MiB to install, {} MiB free", to_mebi(bytes), to_mebi(available));
        if available <= needed {
            return Err(Error::InsufficientSpace { needed, available });
        }

        let ticket = self.template.forge_sealed(tmd.title_id, &self.es)?;
        Ok(Plan { tmd, signature_ok, app, data, layout, ticket, bytes })
    }

    fn check_header(&self, app: &Path, tmd: &TitleMetadata) -> Result<()> {
        let mut header = [0u8; AppHeader::SIZE];
        File::open(app).and_then(|mut file| file.read_exact(&mut header)).map_err(Error::file(app))?;
        let header = AppHeader::parse(&header)?;
        if header.title_id != tmd.title_id {
            warn!("application header names title {:016x}, TMD {:016x}", header.title_id, tmd.title_id);
        }
        if let Some(region) = self.region {
            if !header.runs_in(region) {
                return Err(Error::RegionMismatch { app: header.region_mask, device: region.bits() });
            }
        }
        Ok(())
    }

    /// Regular files directly in `dir`, sorted, with their digests.
    fn data_files(&self, dir: &Path) -> Result<Vec<(PathBuf, [u8; SHA1_LEN])>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(Error::file(dir))? {
            let path = entry.map_err(Error::file(dir))?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        let mut hashed = Vec::with_capacity(files.len());
        for path in files {
            let (digest, _) = self.hash(&path)?;
            hashed.push((path, digest));
        }
        Ok(hashed)
    }

    fn hash(&self, path: &Path) -> Result<([u8; SHA1_LEN], u64)> {
        let mut buf = self.pool.alloc()?;
        sha1_file(path, &mut buf).map_err(Error::file(path))
    }

    fn verify(&self, path: &Path, expected: &[u8; SHA1_LEN]) -> Result<()> {
        let (digest, _) = self.hash(path)?;
        if digest != *expected {
            return Err(Error::DigestMismatch(path.to_path_buf()));
        }
        Ok(())
    }

    fn write(&self, plan: &Plan, steps: &mut Vec<InstallStep>) -> Result<()> {
        let layout = &plan.layout;
        for dir in [layout.ticket.parent(), Some(layout.content_dir.as_path())].into_iter().flatten() {
            fs::create_dir_all(dir).map_err(Error::file(dir))?;
        }

        write_new(&layout.ticket, &plan.ticket)?;
        self.verify(&layout.ticket, &sha1(&plan.ticket))?;
        steps.push(InstallStep::Ticket(layout.ticket.clone()));

        let tmd = layout.tmd();
        fs::write(&tmd, plan.tmd.as_bytes()).map_err(Error::file(&tmd))?;
        self.verify(&tmd, &sha1(plan.tmd.as_bytes()))?;
        steps.push(InstallStep::Metadata(tmd));

        let app = layout.content_dir.join(plan.tmd.content.file_name());
        self.copy(&plan.app, &app)?;
        self.verify(&app, &plan.tmd.content.sha1)?;
        steps.push(InstallStep::Content(app));

        if !plan.data.is_empty() {
            fs::create_dir_all(&layout.data_dir).map_err(Error::file(&layout.data_dir))?;
        }
        for (source, digest) in &plan.data {
            let target = match source.file_name() {
                Some(name) => layout.data_dir.join(name),
                None => continue,
            };
            self.copy(source, &target)?;
            self.verify(&target, digest)?;
            steps.push(InstallStep::Data(target));
        }
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let mut buf = self.pool.alloc()?;
        let mut source = File::open(from).map_err(Error::file(from))?;
        let mut target = File::create(to).map_err(Error::file(to))?;
        let mut total = 0u64;
        loop {
            let read = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::file(from)(e)),
            };
            target.write_all(&buf[..read]).map_err(Error::file(to))?;
            total += read as u64;
        }
        debug!("copied {} bytes to {}", total, to.display());
        Ok(total)
    }
}

/// Create `path` with `data`, refusing to replace an existing file.
fn write_new(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_path_buf()),
        _ => Error::file(path)(e),
    })?;
    file.write_all(data).map_err(Error::file(path))
}
