use kontalk_openpgp::DecryptErrorKind;

/// Errors reported through the exit status.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The signature did not verify or the envelope was suspicious.
    #[error("Message failed {0} security checks")]
    Unverified(usize),

    /// The message could not be decrypted.
    #[error("Unable to decrypt: {0}")]
    CannotDecrypt(DecryptErrorKind),

    /// The key pack is incomplete or damaged.
    #[error("Invalid key pack")]
    BadKeyPack,

    /// Malformed input.
    #[error("Invalid data")]
    BadData,

    /// Output file already exists.
    #[error("Output file already exists")]
    OutputExists,

    /// Input file does not exist.
    #[error("Input file does not exist")]
    MissingInput,

    /// The passphrase does not unlock the key.
    #[error("Bad passphrase")]
    BadPassphrase,
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        use Error::*;
        match e {
            Unverified(_) => 3,
            CannotDecrypt(kind) => 100 + kind.code(),
            BadKeyPack => 41,
            BadData => 43,
            OutputExists => 59,
            MissingInput => 61,
            BadPassphrase => 67,
        }
    }
}

/// Prints the error and causes, if any.
pub fn print_error_chain(err: &anyhow::Error) {
    eprintln!("           {}", err);
    err.chain().skip(1).for_each(|cause| eprintln!("  because: {}", cause));
}
