//! Ticket templates and forging.
//!
//! A ticket that is already present on the console is taken as a template. Forging copies it
//! byte for byte and only replaces the title id, then seals the result as an ES block.

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::es_block::{self, EsCipher};
use crate::error::{Error, Result};

pub const PLAIN_TICKET_SIZE: usize = 0x2A4;
pub const STORED_TICKET_SIZE: usize = PLAIN_TICKET_SIZE + es_block::FOOTER_SIZE;
const TITLE_ID_OFFSET: usize = 0x1DC;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TicketTemplate {
    plain: Vec<u8>,
    source: Option<PathBuf>,
}

impl TicketTemplate {
    pub fn from_plain(plain: Vec<u8>) -> Result<Self> {
        if plain.len() != PLAIN_TICKET_SIZE {
            return Err(Error::malformed("ticket", format!("{} bytes, expected {:#x}", plain.len(), PLAIN_TICKET_SIZE)));
        }
        Ok(Self { plain, source: None })
    }

    /// Find the first stored ticket in `dir` that authenticates under `es`.
    ///
    /// Files are tried in name order, anything that is not exactly one stored ticket long is
    /// skipped without being read.
    pub fn discover(dir: &Path, es: &EsCipher) -> Result<Self> {
        let mut candidates = Vec::new();
        for entry in fs::read_dir(dir).map_err(Error::file(dir))? {
            let entry = entry.map_err(Error::file(dir))?;
            let metadata = entry.metadata().map_err(Error::file(entry.path()))?;
            if metadata.is_file() && metadata.len() == STORED_TICKET_SIZE as u64 {
                candidates.push(entry.path());
            }
        }
        candidates.sort();

        for path in candidates {
            let stored = fs::read(&path).map_err(Error::file(&path))?;
            match es.decrypt(&stored) {
                Ok(plain) => {
                    info!("ticket template: {}", path.display());
                    let mut template = Self::from_plain(plain)?;
                    template.source = Some(path);
                    return Ok(template);
                }
                Err(e) => debug!("{} is not a usable template: {}", path.display(), e),
            }
        }
        Err(Error::NoTicketTemplate(dir.to_path_buf()))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn title_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.plain[TITLE_ID_OFFSET..TITLE_ID_OFFSET + 8]);
        u64::from_be_bytes(id)
    }

    /// The template with its title id replaced, and nothing else touched.
    pub fn forge(&self, title_id: u64) -> Vec<u8> {
        let mut ticket = self.plain.clone();
        ticket[TITLE_ID_OFFSET..TITLE_ID_OFFSET + 8].copy_from_slice(&title_id.to_be_bytes());
        ticket
    }

    /// Forge a ticket for `title_id` and seal it for storage.
    pub fn forge_sealed(&self, title_id: u64, es: &EsCipher) -> Result<Vec<u8>> {
        es.encrypt(&self.forge(title_id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keys::derive_es_key;
    use crate::testing::{plain_ticket, test_identity, TEST_TITLE_ID};

    fn es() -> EsCipher {
        EsCipher::new(&derive_es_key(&test_identity().console_id))
    }

    #[test]
    fn forge_only_touches_title_id() {
        let template = TicketTemplate::from_plain(plain_ticket(0x0003_0004_4141_4141)).unwrap();
        let forged = template.forge(TEST_TITLE_ID);
        assert_eq!(forged.len(), PLAIN_TICKET_SIZE);
        for (i, (a, b)) in forged.iter().zip(template.plain.iter()).enumerate() {
            if !(TITLE_ID_OFFSET..TITLE_ID_OFFSET + 8).contains(&i) {
                assert_eq!(a, b, "byte {:#x} changed", i);
            }
        }
        assert_eq!(TicketTemplate::from_plain(forged).unwrap().title_id(), TEST_TITLE_ID);
    }

    #[test]
    fn sealed_ticket_opens_with_the_same_key() {
        let template = TicketTemplate::from_plain(plain_ticket(1)).unwrap();
        let sealed = template.forge_sealed(TEST_TITLE_ID, &es()).unwrap();
        assert_eq!(sealed.len(), STORED_TICKET_SIZE);
        assert_eq!(es().decrypt(&sealed).unwrap(), template.forge(TEST_TITLE_ID));
    }

    #[test]
    fn discovery_skips_unusable_files() {
        let dir = tempfile::tempdir().unwrap();
        // right size, wrong key
        let foreign = EsCipher::new(&[0x11; 16]).encrypt(&plain_ticket(2)).unwrap();
        fs::write(dir.path().join("00000000.tik"), &foreign).unwrap();
        // wrong size
        fs::write(dir.path().join("00000001.tik"), [0u8; 0x100]).unwrap();
        // usable
        let good = es().encrypt(&plain_ticket(3)).unwrap();
        fs::write(dir.path().join("00000002.tik"), &good).unwrap();
        fs::create_dir(dir.path().join("00000003")).unwrap();

        let template = TicketTemplate::discover(dir.path(), &es()).unwrap();
        assert_eq!(template.title_id(), 3);
        assert_eq!(template.source(), Some(dir.path().join("00000002.tik").as_path()));
    }

    #[test]
    fn discovery_without_candidates() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(TicketTemplate::discover(dir.path(), &es()), Err(Error::NoTicketTemplate(_))));
    }

    #[test]
    fn wrong_size_plain_ticket() {
        assert!(TicketTemplate::from_plain(vec![0u8; 0x2A0]).is_err());
    }
}
