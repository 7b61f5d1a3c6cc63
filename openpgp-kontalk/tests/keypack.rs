use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::time::{Duration, SystemTime};

use sequoia_openpgp as openpgp;
use openpgp::serialize::SerializeInto;

use zip::write::{FileOptions, ZipWriter};

use kontalk_openpgp::{KeyPairRing, PersonalKey, Result};
use kontalk_openpgp::bridge;
use kontalk_openpgp::errors::Error;
use kontalk_openpgp::keypack::{
    self,
    KeyPackExporter,
    KeyPackImporter,
    TrustedFingerprint,
};

fn rings() -> Result<(PersonalKey, KeyPairRing)> {
    let key = PersonalKey::create(SystemTime::now() - Duration::from_secs(600))?;
    let ring = key.store_network("alice", "kontalk.net", "Alice", "secret")?;
    let key = PersonalKey::from_ring(&ring, "secret", None)?;
    Ok((key, ring))
}

fn encoded(ring: &KeyPairRing) -> Result<(Vec<u8>, Vec<u8>)> {
    Ok((ring.secret().as_tsk().to_vec()?, ring.public().to_vec()?))
}

#[test]
fn export_import() -> Result<()> {
    let (key, ring) = rings()?;
    let (secret, public) = encoded(&ring)?;
    let cert = bridge::from_personal_key(&key, &public)?;

    let mut trusted = BTreeMap::new();
    trusted.insert("bob@kontalk.net".to_string(),
                   TrustedFingerprint::new(
                       "0123456789ABCDEF0123456789ABCDEF01234567",
                       keypack::TRUST_VERIFIED));

    let pack = KeyPackExporter::new(&secret, &public, "secret", "+15555550123")
        .export_passphrase("exported")
        .bridge_cert(&cert)
        .trusted_keys(&trusted)
        .save(Cursor::new(Vec::new()))?
        .into_inner();

    let importer = KeyPackImporter::load(&pack[..], "exported")?;
    assert_eq!(importer.phone_number().as_deref(), Some("+15555550123"));
    assert_eq!(importer.trusted_keys()?, Some(trusted));
    assert!(importer.bridge_certificate().is_some());

    let imported = importer.load_personal_key()?;
    assert_eq!(imported.fingerprint(), key.fingerprint());
    assert!(imported.bridge_certificate().is_some());

    // The old passphrase no longer unlocks the exported ring.
    let stale = KeyPackImporter::load(&pack[..], "secret")?;
    assert!(stale.create_key_pair_ring().is_err());
    Ok(())
}

#[test]
fn entries_in_any_order() -> Result<()> {
    let (key, ring) = rings()?;
    let public = ring.public().armored().to_vec()?;
    let secret = ring.secret().as_tsk().armored().to_vec()?;

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();
    zip.start_file("README", options)?;
    zip.write_all(b"not a key")?;
    zip.start_file(keypack::PRIVATE_KEY_FILENAME, options)?;
    zip.write_all(&secret)?;
    zip.start_file(keypack::PUBLIC_KEY_FILENAME, options)?;
    zip.write_all(&public)?;
    let pack = zip.finish()?.into_inner();

    let importer = KeyPackImporter::load(&pack[..], "secret")?;
    assert_eq!(importer.phone_number(), None);
    assert_eq!(importer.trusted_keys()?, None);
    let loaded = importer.create_key_pair_ring()?;
    assert_eq!(loaded.public().fingerprint(), ring.public().fingerprint());
    assert_eq!(importer.load_personal_key()?.fingerprint(), key.fingerprint());
    Ok(())
}

#[test]
fn missing_entry() -> Result<()> {
    let (_, ring) = rings()?;

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(keypack::PUBLIC_KEY_FILENAME, FileOptions::default())?;
    zip.write_all(&ring.public().armored().to_vec()?)?;
    let pack = zip.finish()?.into_inner();

    let err = KeyPackImporter::load(&pack[..], "secret").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidData(_))),
            "{}", err);
    Ok(())
}

#[test]
fn oversized_entry() -> Result<()> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(keypack::PUBLIC_KEY_FILENAME, FileOptions::default())?;
    zip.write_all(&vec![b'x'; keypack::MAX_ENTRY_SIZE as usize + 1])?;
    let pack = zip.finish()?.into_inner();

    let err = KeyPackImporter::load(&pack[..], "secret").unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidData(_))),
            "{}", err);
    Ok(())
}
