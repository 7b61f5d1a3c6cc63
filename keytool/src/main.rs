use std::io::{Read, Write};
use std::time::SystemTime;

use anyhow::Context;
use log::info;
use structopt::StructOpt;

use sequoia_openpgp as openpgp;
use openpgp::Cert;
use openpgp::serialize::SerializeInto;

use kontalk_openpgp::{
    Coder,
    CryptoContext,
    DecryptError,
    PersonalKey,
    PgpCoder,
    bridge,
    keypack::{KeyPackExporter, KeyPackImporter},
    keys,
    userid,
};

mod errors;
use errors::{Error, print_error_chain};
type Result<T> = anyhow::Result<T>;

mod cli;
use cli::{
    Cli, Command, KeyArgs,
    create_file, create_output, load_file, open_input, read_passphrase_file,
    write_file,
};

fn main() {
    use std::process::exit;

    env_logger::init();
    match real_main() {
        Ok(()) => (),
        Err(e) => {
            print_error_chain(&e);
            if let Ok(e) = e.downcast::<Error>() {
                exit(e.into())
            }
            exit(1);
        },
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::from_args();
    let ctx = CryptoContext::new(&cli.network);

    match cli.cmd {
        Command::Generate {
            user, name, passphrase, secret_out, public_out, bridge_out,
        } => {
            info!("kontalk-keytool generate");
            let passphrase = passphrase.resolve("Enter passphrase for the new key: ")?;
            let key = PersonalKey::create(SystemTime::now())?;
            let ring = key.store_network(&user, ctx.network(), &name, &passphrase)?;

            write_file(&secret_out, &ring.secret().as_tsk().armored().to_vec()?)?;
            write_file(&public_out, &ring.public().armored().to_vec()?)?;
            if let Some(path) = bridge_out {
                let key = PersonalKey::from_ring(&ring, &passphrase, None)?;
                let cert = bridge::from_personal_key(&key, &ring.public().to_vec()?)?;
                write_file(&path, cert.pem().as_bytes())?;
            }

            println!("{}", keys::format_fingerprint(&key.fingerprint()));
        },

        Command::Fingerprint { uri, cert } => {
            let cert = load_cert(&cert)?;
            let fpr = keys::fingerprint(cert.primary_key().key());
            if uri {
                println!("{}", keys::fingerprint_uri(&fpr));
            } else {
                println!("{}", keys::format_fingerprint(&fpr));
            }
            if let Some(uid) = userid::user_id(&cert, Some(ctx.network())) {
                println!("{}", uid);
            }
        },

        Command::Encrypt { key, recipients, stanza, file, io } => {
            info!("kontalk-keytool encrypt");
            let personal = load_key(&key)?.personal;
            let recipients = recipients.iter()
                .map(|path| load_cert(path))
                .collect::<Result<Vec<_>>>()?;
            let coder = PgpCoder::for_recipients(&ctx, &personal, &recipients);

            let mut input = open_input(io.input.as_deref())?;
            let mut output = create_output(io.output.as_deref())?;
            if file {
                coder.encrypt_file(&mut *input, &mut *output)?;
            } else {
                let mut text = String::new();
                input.read_to_string(&mut text)
                    .map_err(|_| Error::BadData)
                    .context("Input is not UTF-8 text")?;
                let encrypted = if stanza {
                    coder.encrypt_stanza(&text)?
                } else {
                    coder.encrypt_text(&text)?
                };
                output.write_all(&encrypted)?;
            }
        },

        Command::Decrypt { key, sender, no_verify, file, io } => {
            info!("kontalk-keytool decrypt");
            let personal = load_key(&key)?.personal;
            let sender = sender.as_deref().map(load_cert).transpose()?;
            let coder = PgpCoder::from_sender(&ctx, &personal, sender.as_ref());

            let mut input = open_input(io.input.as_deref())?;
            let mut output = create_output(io.output.as_deref())?;
            if file {
                let mut errors = Vec::new();
                coder.decrypt_file(&mut *input, ! no_verify, &mut *output,
                                   &mut errors)
                    .map_err(cannot_decrypt)?;
                report(&errors)?;
            } else {
                let mut data = Vec::new();
                input.read_to_end(&mut data)?;
                let decrypted = coder.decrypt_text(&data, ! no_verify)
                    .map_err(cannot_decrypt)?;
                info!("security flags {:?}", decrypted.security_flags());
                output.write_all(decrypted.body().as_bytes())?;
                output.flush()?;
                report(decrypted.errors())?;
            }
        },

        Command::Verify { key, sender, io } => {
            info!("kontalk-keytool verify");
            let personal = load_key(&key)?.personal;
            let sender = load_cert(&sender)?;
            let coder = PgpCoder::from_sender(&ctx, &personal, Some(&sender));

            let mut data = Vec::new();
            open_input(io.input.as_deref())?.read_to_end(&mut data)?;
            let verified = coder.verify_text(&data, true)
                .map_err(|e| anyhow::Error::from(e).context(Error::BadData))?;
            let mut output = create_output(io.output.as_deref())?;
            output.write_all(verified.body().as_bytes())?;
            output.flush()?;

            for e in verified.errors() {
                eprintln!("Warning: {}", e);
            }
            if ! verified.errors().is_empty() {
                return Err(Error::Unverified(verified.errors().len()).into());
            }
        },

        Command::ExportPack { key, phone, export_passphrase_file, output } => {
            info!("kontalk-keytool export-pack");
            let loaded = load_key(&key)?;
            let export_passphrase = export_passphrase_file.as_deref()
                .map(read_passphrase_file)
                .transpose()?;
            let bridge_cert = match loaded.personal.bridge_certificate() {
                Some(cert) => cert.clone(),
                None => bridge::from_personal_key(&loaded.personal, &loaded.public)?,
            };

            let mut exporter = KeyPackExporter::new(
                &loaded.secret, &loaded.public, &loaded.passphrase, &phone)
                .bridge_cert(&bridge_cert);
            if let Some(passphrase) = export_passphrase.as_deref() {
                exporter = exporter.export_passphrase(passphrase);
            }
            exporter.save(create_file(&output)?)?;
        },

        Command::ImportPack {
            passphrase, secret_out, public_out, bridge_out, pack,
        } => {
            info!("kontalk-keytool import-pack");
            let passphrase = passphrase.resolve("Enter key pack passphrase: ")?;
            let importer = KeyPackImporter::load(&load_file(&pack)?[..], &passphrase)
                .map_err(|e| e.context(Error::BadKeyPack))?;
            let personal = importer.load_personal_key().map_err(bad_passphrase)?;

            write_file(&secret_out, importer.private_key())?;
            write_file(&public_out, importer.public_key())?;
            if let (Some(path), Some(cert)) =
                (bridge_out, personal.bridge_certificate())
            {
                write_file(&path, cert.pem().as_bytes())?;
            }

            println!("{}", keys::format_fingerprint(&personal.fingerprint()));
            if let Some(phone) = importer.phone_number() {
                println!("{}", phone);
            }
            for (jid, trusted) in importer.trusted_keys()?.unwrap_or_default() {
                println!("{} {}", jid, trusted);
            }
        },

        Command::ChangePassphrase {
            secret_key, passphrase, new_passphrase_file, output,
        } => {
            info!("kontalk-keytool change-passphrase");
            let secret = load_file(&secret_key)?;
            let old = passphrase.resolve("Enter current passphrase: ")?;
            let new = read_passphrase_file(&new_passphrase_file)?;
            let changed = PersonalKey::change_passphrase(&secret, &old, &new)
                .map_err(bad_passphrase)?;
            let changed = keys::parse_public_ring(&changed)?;
            create_output(output.as_deref())?
                .write_all(&changed.as_tsk().armored().to_vec()?)?;
        },

        Command::Revoke { key, output } => {
            info!("kontalk-keytool revoke");
            let mut personal = load_key(&key)?.personal;
            let revoked = personal.revoke(true)?;
            create_output(output.as_deref())?
                .write_all(&revoked.armored().to_vec()?)?;
        },

        Command::Bridge { key, output, pkcs12 } => {
            info!("kontalk-keytool bridge");
            let loaded = load_key(&key)?;
            let cert = bridge::from_personal_key(&loaded.personal, &loaded.public)?;
            if let Some(path) = pkcs12 {
                write_file(&path, &bridge::export_pkcs12(
                    &cert, loaded.personal.ring().auth(), &loaded.passphrase)?)?;
            }
            create_output(output.as_deref())?.write_all(cert.pem().as_bytes())?;
        },
    }

    Ok(())
}

/// An unlocked personal key and the material it was loaded from.
struct LoadedKey {
    personal: PersonalKey,
    secret: Vec<u8>,
    public: Vec<u8>,
    passphrase: String,
}

fn load_key(args: &KeyArgs) -> Result<LoadedKey> {
    let secret = load_file(&args.secret_key)?;
    let public = load_file(&args.public_key)?;
    let bridge_cert = args.bridge_cert.as_deref().map(load_file).transpose()?;
    let passphrase = args.passphrase.resolve("Enter passphrase: ")?;

    let personal = PersonalKey::load(&secret, &public, &passphrase,
                                     bridge_cert.as_deref())
        .map_err(bad_passphrase)?;
    Ok(LoadedKey { personal, secret, public, passphrase })
}

fn load_cert(path: &std::path::Path) -> Result<Cert> {
    keys::parse_public_ring(&load_file(path)?)
        .map_err(|e| e.context(Error::BadData))
        .with_context(|| format!("Failed to load certificate {:?}", path))
}

fn bad_passphrase(e: anyhow::Error) -> anyhow::Error {
    if matches!(e.downcast_ref::<kontalk_openpgp::Error>(),
                Some(kontalk_openpgp::Error::BadPassphrase)) {
        e.context(Error::BadPassphrase)
    } else {
        e
    }
}

fn cannot_decrypt(e: DecryptError) -> anyhow::Error {
    let kind = e.kind();
    anyhow::Error::from(e).context(Error::CannotDecrypt(kind))
}

/// Prints the problems found while decrypting.
fn report(errors: &[DecryptError]) -> Result<()> {
    for e in errors {
        eprintln!("Warning: {}", e);
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Unverified(errors.len()).into())
    }
}
