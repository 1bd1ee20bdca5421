//! Whole-image operations on file-backed NAND dumps.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::blockdev::{BlockDevice, RawImage, SECTOR_SIZE};
use crate::crypto::sha1_file;
use crate::error::{Error, Result};
use crate::footer::{self, ImageLayout, FOOTER_SIZE};
use crate::identity::DeviceIdentity;
use crate::keys::Variant;
use crate::nand::{Nand, CHUNK_SECTORS};
use crate::scratch::ScratchPool;
use crate::sector0::{NcsdHeader, PartitionEntry};
use crate::stage2::{self, Stage2Dump, Stage2Part};

/// What [`check_image`] found.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageReport {
    pub variant: Variant,
    pub sectors: u64,
    pub has_footer: bool,
    pub partitions: Vec<PartitionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncsd: Option<NcsdHeader>,
}

fn layout(path: &Path) -> Result<ImageLayout> {
    let len = fs::metadata(path).map_err(Error::file(path))?.len();
    ImageLayout::from_len(len)
}

fn read_footer(path: &Path) -> Result<[u8; FOOTER_SIZE]> {
    let mut footer = [0u8; FOOTER_SIZE];
    let mut file = File::open(path).map_err(Error::file(path))?;
    file.seek(SeekFrom::End(-(FOOTER_SIZE as i64))).map_err(Error::file(path))?;
    file.read_exact(&mut footer).map_err(Error::file(path))?;
    Ok(footer)
}

/// The identity recorded in the image's footer, if it has one.
pub fn footer_identity(path: &Path) -> Result<Option<DeviceIdentity>> {
    if !layout(path)?.has_footer() {
        return Ok(None);
    }
    footer::decode(&read_footer(path)?).map(Some)
}

/// Validate size, footer and sector 0 of the image at `path` against `identity`.
pub fn check_image(path: &Path, identity: &DeviceIdentity) -> Result<ImageReport> {
    let layout = layout(path)?;
    if layout.has_footer() {
        footer::validate(&read_footer(path)?, identity)?;
        info!("footer OK");
    } else {
        info!("no footer");
    }

    let mut raw = RawImage::open(path, false)?;
    let mut sector = [0u8; SECTOR_SIZE];
    raw.read_sectors(0, 1, &mut sector)?;
    let ncsd = NcsdHeader::parse(&sector);

    let nand = Nand::open(raw, identity)?;
    let partitions = nand.partition_table().entries.iter().copied().filter(|entry| !entry.is_empty()).collect();
    Ok(ImageReport { variant: nand.variant(), sectors: layout.sectors(), has_footer: layout.has_footer(), partitions, ncsd })
}

/// Append the identity footer to a bare image.
///
/// The image must decrypt under `identity` first, so a footer is never stamped with the
/// wrong identifiers.
pub fn append_footer(path: &Path, identity: &DeviceIdentity) -> Result<()> {
    if layout(path)?.has_footer() {
        return Err(Error::AlreadyExists(path.to_path_buf()));
    }
    Nand::open(RawImage::open(path, false)?, identity)?;

    let mut file = OpenOptions::new().append(true).open(path).map_err(Error::file(path))?;
    file.write_all(&footer::encode(identity)).map_err(Error::file(path))?;
    info!("footer appended to {}", path.display());
    Ok(())
}

/// Write the decrypted sectors of `src` to `dst`.
///
/// `progress` is called with (sectors done, sectors total) after every chunk. Returns the
/// number of sectors written.
pub fn decrypt_image(src: &Path, dst: &Path, identity: &DeviceIdentity, progress: impl FnMut(u64, u64)) -> Result<u64> {
    let mut out = File::create(dst).map_err(Error::file(dst))?;
    let sectors = decrypt_into(src, &mut out, identity, progress)?;
    info!("decrypted {} sectors to {}", sectors, dst.display());
    Ok(sectors)
}

/// Like [`decrypt_image`], writing to any sink.
pub fn decrypt_into(src: &Path, out: &mut impl Write, identity: &DeviceIdentity, mut progress: impl FnMut(u64, u64)) -> Result<u64> {
    layout(src)?;
    let mut nand = Nand::open(RawImage::open(src, false)?, identity)?;
    let total = nand.sector_count();
    let mut chunk = vec![0u8; CHUNK_SECTORS * SECTOR_SIZE];

    let mut done = 0u64;
    while done < total {
        let count = (total - done).min(CHUNK_SECTORS as u64) as usize;
        let buf = &mut chunk[..count * SECTOR_SIZE];
        nand.read_sectors(done, count, buf)?;
        out.write_all(buf)?;
        done += count as u64;
        progress(done, total);
    }
    out.flush()?;
    Ok(total)
}

/// Decrypt one stage2 blob of the image at `path` into `out`, see [`stage2::dump`].
///
/// Works on the raw image; no identity is needed.
pub fn dump_stage2(
    path: &Path,
    part: Stage2Part,
    key: &[u8; 16],
    out: &mut impl Write,
    progress: impl FnMut(u64, u64),
) -> Result<Stage2Dump> {
    layout(path)?;
    let mut raw = RawImage::open(path, false)?;
    stage2::dump(&mut raw, part, key, out, progress)
}

/// Write `<file>.sha1` next to `path`, in the form manifests use.
pub fn write_sha1_sidecar(path: &Path, pool: &ScratchPool) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::malformed("path", format!("{} has no file name", path.display())))?;
    let digest = {
        let mut buf = pool.alloc()?;
        sha1_file(path, &mut buf).map_err(Error::file(path))?.0
    };
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha1");
    let sidecar = PathBuf::from(sidecar);
    fs::write(&sidecar, format!("{} *{}\n", hex::encode_upper(digest), name)).map_err(Error::file(&sidecar))?;
    Ok(sidecar)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::sha1;
    use crate::scripting::{Engine, Mode, Script};
    use crate::sector0::PartitionTable;
    use crate::testing::{encrypted_image, test_identity};

    fn image_file(dir: &Path, variant: Variant) -> PathBuf {
        let path = dir.join("nand.bin");
        fs::write(&path, encrypted_image(&test_identity(), variant, 4).into_inner()).unwrap();
        path
    }

    #[test]
    fn check_bare_and_footed_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::Dsi);

        let report = check_image(&path, &test_identity()).unwrap();
        assert_eq!(report.variant, Variant::Dsi);
        assert!(!report.has_footer);
        assert_eq!(report.partitions[..2], PartitionTable::reference(Variant::Dsi).entries[..2]);
        assert_eq!(report.ncsd, None);
        assert_eq!(footer_identity(&path).unwrap(), None);

        append_footer(&path, &test_identity()).unwrap();
        assert!(check_image(&path, &test_identity()).unwrap().has_footer);
        assert_eq!(footer_identity(&path).unwrap(), Some(test_identity()));
        assert!(matches!(append_footer(&path, &test_identity()), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn footer_for_another_console() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::Dsi);
        append_footer(&path, &test_identity()).unwrap();
        let mut other = test_identity();
        other.cid[0] ^= 1;
        assert!(matches!(check_image(&path, &other), Err(Error::IdentityMismatch)));
    }

    #[test]
    fn wrong_identity_never_gets_a_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::Dsi);
        let len = fs::metadata(&path).unwrap().len();
        let mut other = test_identity();
        other.console_id[7] ^= 1;
        assert!(matches!(append_footer(&path, &other), Err(Error::Sector0Mismatch(_))));
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn odd_sizes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nand.bin");
        fs::write(&path, vec![0u8; 1000]).unwrap();
        assert!(matches!(check_image(&path, &test_identity()), Err(Error::WrongSize(1000))));
    }

    #[test]
    fn three_ds_report_carries_ncsd() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::ThreeDs);
        let report = check_image(&path, &test_identity()).unwrap();
        assert_eq!(report.variant, Variant::ThreeDs);
        assert!(report.ncsd.is_some());
    }

    #[test]
    fn decrypt_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::Dsi);
        let out = dir.path().join("plain.bin");
        let mut calls = Vec::new();
        let sectors = decrypt_image(&path, &out, &test_identity(), |done, total| calls.push((done, total))).unwrap();

        let plain = fs::read(&out).unwrap();
        assert_eq!(plain.len() as u64, sectors * SECTOR_SIZE as u64);
        assert_eq!(&plain[0x1FE..0x200], &[0x55, 0xAA]);
        let boot = 0x877 * SECTOR_SIZE;
        assert_eq!(&plain[boot + 0x36..boot + 0x39], b"FAT");
        assert_eq!(calls.last(), Some(&(sectors, sectors)));
        assert!(calls.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn stage2_from_an_image_file() {
        use crate::stage2::test::{add_stage2, blob, ARM7, BOOT2_KEY};

        let dir = tempfile::tempdir().unwrap();
        let path = image_file(dir.path(), Variant::Dsi);
        let mut data = fs::read(&path).unwrap();
        add_stage2(&mut data);
        fs::write(&path, data).unwrap();
        append_footer(&path, &test_identity()).unwrap();

        let mut out = Vec::new();
        let dump = dump_stage2(&path, Stage2Part::Arm7, &BOOT2_KEY, &mut out, |_, _| {}).unwrap();
        assert_eq!(out, blob(&ARM7, 7));
        assert_eq!(dump.sha1, sha1(&out));
    }

    #[test]
    fn sidecar_feeds_the_manifest_engine() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("sd");
        let root = dir.path().join("nand");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&root).unwrap();
        let file = source.join("HWINFO_S.dat");
        fs::write(&file, b"hardware info").unwrap();

        let pool = ScratchPool::default();
        let sidecar = write_sha1_sidecar(&file, &pool).unwrap();
        let text = fs::read_to_string(&sidecar).unwrap();
        assert_eq!(text, format!("{} *HWINFO_S.dat\n", hex::encode_upper(sha1(b"hardware info"))));

        let summary = Engine::new(&root, &source, &pool).run(&Script::parse(&text), Mode::DryRun).unwrap();
        assert_eq!((summary.ok, summary.bytes), (1, 13));
    }
}
