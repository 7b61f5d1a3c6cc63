use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use structopt::StructOpt;

use super::{Error, Result};

#[derive(StructOpt)]
#[structopt(name = "kontalk-keytool",
            about = "Manages Kontalk personal keys and \
                     end-to-end encrypted messages")]
pub struct Cli {
    /// The network user IDs belong to.
    #[structopt(long, env = "KONTALK_NETWORK", default_value = "kontalk.net")]
    pub network: String,
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(StructOpt)]
pub enum Command {
    /// Generates a personal key.
    Generate {
        /// The local part of the user ID's address.
        #[structopt(long)]
        user: String,
        /// The display name.
        #[structopt(long)]
        name: String,
        #[structopt(flatten)]
        passphrase: PassphraseArgs,
        /// Writes the secret key ring to this file.
        #[structopt(long, parse(from_os_str))]
        secret_out: PathBuf,
        /// Writes the public key ring to this file.
        #[structopt(long, parse(from_os_str))]
        public_out: PathBuf,
        /// Writes a bridge certificate to this file.
        #[structopt(long, parse(from_os_str))]
        bridge_out: Option<PathBuf>,
    },
    /// Prints the fingerprint and user ID of a certificate.
    Fingerprint {
        /// Prints the fingerprint as an openpgp4fpr URI.
        #[structopt(long)]
        uri: bool,
        /// The certificate.
        #[structopt(parse(from_os_str))]
        cert: PathBuf,
    },
    /// Encrypts and signs a message.
    Encrypt {
        #[structopt(flatten)]
        key: KeyArgs,
        /// Encrypts for the holder of this certificate.
        #[structopt(long = "recipient", short = "r", required = true,
                    parse(from_os_str))]
        recipients: Vec<PathBuf>,
        /// Treats the input as an XMPP stanza.
        #[structopt(long)]
        stanza: bool,
        /// Treats the input as an attachment.
        #[structopt(long, conflicts_with = "stanza")]
        file: bool,
        #[structopt(flatten)]
        io: IoArgs,
    },
    /// Decrypts a message.
    Decrypt {
        #[structopt(flatten)]
        key: KeyArgs,
        /// The certificate of the sender.
        #[structopt(long, parse(from_os_str))]
        sender: Option<PathBuf>,
        /// Skips signature and envelope checks.
        #[structopt(long)]
        no_verify: bool,
        /// Treats the input as an attachment.
        #[structopt(long)]
        file: bool,
        #[structopt(flatten)]
        io: IoArgs,
    },
    /// Verifies signed data.
    Verify {
        #[structopt(flatten)]
        key: KeyArgs,
        /// The certificate of the signer.
        #[structopt(long, parse(from_os_str))]
        sender: PathBuf,
        #[structopt(flatten)]
        io: IoArgs,
    },
    /// Exports the personal key into a key pack.
    ExportPack {
        #[structopt(flatten)]
        key: KeyArgs,
        /// The phone number of the account.
        #[structopt(long)]
        phone: String,
        /// Protects the exported key with the passphrase in this file.
        #[structopt(long, parse(from_os_str))]
        export_passphrase_file: Option<PathBuf>,
        /// The key pack to create.
        #[structopt(long, short = "o", parse(from_os_str))]
        output: PathBuf,
    },
    /// Imports a personal key from a key pack.
    ImportPack {
        #[structopt(flatten)]
        passphrase: PassphraseArgs,
        /// Writes the secret key ring to this file.
        #[structopt(long, parse(from_os_str))]
        secret_out: PathBuf,
        /// Writes the public key ring to this file.
        #[structopt(long, parse(from_os_str))]
        public_out: PathBuf,
        /// Writes the new bridge certificate to this file.
        #[structopt(long, parse(from_os_str))]
        bridge_out: Option<PathBuf>,
        /// The key pack.
        #[structopt(parse(from_os_str))]
        pack: PathBuf,
    },
    /// Protects a secret key ring with a new passphrase.
    ChangePassphrase {
        /// The secret key ring.
        #[structopt(long, parse(from_os_str))]
        secret_key: PathBuf,
        #[structopt(flatten)]
        passphrase: PassphraseArgs,
        /// Reads the new passphrase from this file.
        #[structopt(long, parse(from_os_str))]
        new_passphrase_file: PathBuf,
        /// Output file.
        #[structopt(long, short = "o", parse(from_os_str))]
        output: Option<PathBuf>,
    },
    /// Revokes the personal key and prints the revoked certificate.
    Revoke {
        #[structopt(flatten)]
        key: KeyArgs,
        /// Output file.
        #[structopt(long, short = "o", parse(from_os_str))]
        output: Option<PathBuf>,
    },
    /// Creates a bridge certificate for the personal key.
    Bridge {
        #[structopt(flatten)]
        key: KeyArgs,
        /// Output file.
        #[structopt(long, short = "o", parse(from_os_str))]
        output: Option<PathBuf>,
        /// Also writes a PKCS#12 bundle protected with the passphrase.
        #[structopt(long, parse(from_os_str))]
        pkcs12: Option<PathBuf>,
    },
}

/// The personal key to operate on.
#[derive(StructOpt)]
pub struct KeyArgs {
    /// The secret key ring.
    #[structopt(long, parse(from_os_str))]
    pub secret_key: PathBuf,
    /// The public key ring.
    #[structopt(long, parse(from_os_str))]
    pub public_key: PathBuf,
    /// The bridge certificate.
    #[structopt(long, parse(from_os_str))]
    pub bridge_cert: Option<PathBuf>,
    #[structopt(flatten)]
    pub passphrase: PassphraseArgs,
}

#[derive(StructOpt)]
pub struct PassphraseArgs {
    /// Reads the passphrase from the first line of this file.
    #[structopt(long, parse(from_os_str))]
    pub passphrase_file: Option<PathBuf>,
    /// The passphrase.
    #[structopt(long = "passphrase", env = "KONTALK_PASSPHRASE",
                hide_env_values = true)]
    pub passphrase: Option<String>,
}

impl PassphraseArgs {
    /// Returns the passphrase, prompting for it if necessary.
    pub fn resolve(&self, prompt: &str) -> Result<String> {
        if let Some(file) = &self.passphrase_file {
            return read_passphrase_file(file);
        }
        if let Some(passphrase) = &self.passphrase {
            return Ok(passphrase.clone());
        }
        rpassword::read_password_from_tty(Some(prompt))
            .context("Failed to read the passphrase")
    }
}

#[derive(StructOpt)]
pub struct IoArgs {
    /// Output file.
    #[structopt(long, short = "o", parse(from_os_str))]
    pub output: Option<PathBuf>,
    /// Input file, stdin if omitted.
    #[structopt(parse(from_os_str))]
    pub input: Option<PathBuf>,
}

/// Reads the first line of `path`.
pub fn read_passphrase_file(path: &Path) -> Result<String> {
    let content = load_file(path)?;
    let content = String::from_utf8(content)
        .map_err(|_| Error::BadData)
        .with_context(|| format!("Passphrase in {:?} is not UTF-8", path))?;
    Ok(content.lines().next().unwrap_or_default().to_string())
}

/// Reads the given file.
pub fn load_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|_| Error::MissingInput)
        .with_context(|| format!("Failed to open file {:?}", path))
}

/// Opens the given file, or stdin.
pub fn open_input(path: Option<&Path>) -> Result<Box<dyn Read + Send + Sync>> {
    match path {
        None => Ok(Box::new(io::stdin())),
        Some(path) => Ok(Box::new(
            File::open(path).map_err(|_| Error::MissingInput)
                .with_context(|| format!("Failed to open file {:?}", path))?)),
    }
}

/// Creates the given file, which must not exist.
pub fn create_file(path: &Path) -> Result<File> {
    if path.exists() {
        return Err(anyhow::Error::from(Error::OutputExists))
            .context(format!("File {:?} exists", path));
    }

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create file {:?}", path))
}

/// Creates the given file, or returns stdout.
pub fn create_output(path: Option<&Path>)
                     -> Result<Box<dyn Write + Send + Sync>> {
    match path {
        None => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(create_file(path)?)),
    }
}

/// Writes `data` to a new file.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    create_file(path)?.write_all(data)?;
    Ok(())
}
