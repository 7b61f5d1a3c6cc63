//! DER conversions for the X.509 bridge
//!
//! CERTIFICATE (See RFC5280 Sec. 4.1)
//!
//! Certificate  ::=  SEQUENCE  {
//!   tbsCertificate       TBSCertificate,
//!   signatureAlgorithm   AlgorithmIdentifier,
//!   signatureValue       BIT STRING
//! }

use std::time::SystemTime;

use bit_vec::BitVec;
use num_bigint::BigUint;
use yasna::models::ObjectIdentifier as Oid;
use yasna::{ASN1Error, ASN1ErrorKind, Tag};

use sequoia_openpgp as openpgp;
use openpgp::crypto::mpi;
use openpgp::packet::key::{Key4, PublicParts, SecretKeyMaterial, UnspecifiedRole};
use openpgp::types::{HashAlgorithm, PublicKeyAlgorithm};

use crate::Result;
use crate::errors::Error;
use crate::keys::{KeyPair, PublicKey};

lazy_static::lazy_static! {
    pub static ref RSA_ENCRYPTION: Oid = Oid::from_slice(&[1, 2, 840, 113549, 1, 1, 1]);
    pub static ref SHA1_WITH_RSA: Oid = Oid::from_slice(&[1, 2, 840, 113549, 1, 1, 5]);
    pub static ref DSA: Oid = Oid::from_slice(&[1, 2, 840, 10040, 4, 1]);
    pub static ref DSA_WITH_SHA1: Oid = Oid::from_slice(&[1, 2, 840, 10040, 4, 3]);

    static ref COMMON_NAME: Oid = Oid::from_slice(&[2, 5, 4, 3]);
    static ref ORGANIZATION: Oid = Oid::from_slice(&[2, 5, 4, 10]);

    pub static ref SUBJECT_KEY_IDENTIFIER: Oid = Oid::from_slice(&[2, 5, 29, 14]);
    pub static ref KEY_USAGE: Oid = Oid::from_slice(&[2, 5, 29, 15]);
    pub static ref SUBJECT_ALT_NAME: Oid = Oid::from_slice(&[2, 5, 29, 17]);
    pub static ref BASIC_CONSTRAINTS: Oid = Oid::from_slice(&[2, 5, 29, 19]);
    pub static ref AUTHORITY_KEY_IDENTIFIER: Oid = Oid::from_slice(&[2, 5, 29, 35]);
    pub static ref NETSCAPE_CERT_TYPE: Oid =
        Oid::from_slice(&[2, 16, 840, 1, 113730, 1, 1]);
    pub static ref XMPP_ADDR: Oid = Oid::from_slice(&[1, 3, 6, 1, 5, 5, 7, 8, 5]);
    pub static ref PGP_PUBLIC_KEY: Oid =
        Oid::from_slice(&[1, 3, 6, 1, 4, 1, 3756, 9, 2, 1]);
}

/// The signature algorithm for a key's algorithm.
pub fn signature_algorithm(key: &PublicKey) -> Result<&'static Oid> {
    match key.mpis() {
        mpi::PublicKey::RSA { .. } => Ok(&*SHA1_WITH_RSA),
        mpi::PublicKey::DSA { .. } => Ok(&*DSA_WITH_SHA1),
        _ => Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
    }
}

fn write_algorithm(w: yasna::DERWriter, oid: &Oid) {
    // RFC3279 Sec. 2.2.1: NULL parameters for RSA, absent for DSA.
    w.write_sequence(|w| {
        w.next().write_oid(oid);
        if *oid == *SHA1_WITH_RSA || *oid == *RSA_ENCRYPTION {
            w.next().write_null();
        }
    })
}

fn biguint(m: &[u8]) -> BigUint {
    BigUint::from_bytes_be(m)
}

pub mod serialize {
    use super::*;

    /// PKCS#1 RSAPrivateKey from OpenPGP key material.
    pub fn rsa_private(
        n: &mpi::MPI,
        e: &mpi::MPI,
        d: &mpi::ProtectedMPI,
        p: &mpi::ProtectedMPI,
        q: &mpi::ProtectedMPI,
        u: &mpi::ProtectedMPI,
    ) -> Vec<u8> {
        // RFC8017 A.1.2
        //
        // RSAPrivateKey ::= SEQUENCE {
        //   version           Version,
        //   modulus           INTEGER,  -- n
        //   publicExponent    INTEGER,  -- e
        //   privateExponent   INTEGER,  -- d
        //   prime1            INTEGER,  -- p
        //   prime2            INTEGER,  -- q
        //   exponent1         INTEGER,  -- d mod (p-1)
        //   exponent2         INTEGER,  -- d mod (q-1)
        //   coefficient       INTEGER,  -- (inverse of q) mod p
        // }
        //
        let (n, e, d, p, q, u) = (
            biguint(n.value()),
            biguint(e.value()),
            biguint(d.value()),
            biguint(p.value()),
            biguint(q.value()),
            biguint(u.value()),
        );

        // OpenPGP stores u = p⁻¹ (mod q).  From up + kq = 1 we get
        // q⁻¹ = k = p - ((up - 1)/q mod p)  (mod p).
        let minus_k = ((u * &p - 1u32) / &q) % &p;
        let coeff = (&p - minus_k) % &p;
        let e1 = &d % (&p - 1u32);
        let e2 = &d % (&q - 1u32);
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_u32(0);
                for mpi in [&n, &e, &d, &p, &q, &e1, &e2, &coeff].iter() {
                    w.next().write_biguint(mpi);
                }
            })
        })
    }

    /// PKCS#1 RSAPrivateKey of an unlocked RSA key.
    pub fn rsa_private_key(key: &KeyPair) -> Result<Vec<u8>> {
        let (n, e) = match key.public().mpis() {
            mpi::PublicKey::RSA { n, e } => (n, e),
            _ => return Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
        };
        match key.secret().secret() {
            SecretKeyMaterial::Unencrypted(secret) => secret.map(|m| match m {
                mpi::SecretKeyMaterial::RSA { d, p, q, u } =>
                    Ok(rsa_private(n, e, d, p, q, u)),
                _ => Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
            }),
            _ => Err(Error::InvalidKeyData(
                "secret key material is encrypted".into()).into()),
        }
    }

    /// PKCS#8 PrivateKeyInfo wrapping an RSA private key.
    pub fn private_key_info(rsa_private: &[u8]) -> Vec<u8> {
        // RFC5208 Sec. 5
        //
        // PrivateKeyInfo ::= SEQUENCE {
        //   version                   Version,
        //   privateKeyAlgorithm       PrivateKeyAlgorithmIdentifier,
        //   privateKey                PrivateKey,
        // }
        //
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_u32(0);
                write_algorithm(w.next(), &RSA_ENCRYPTION);
                w.next().write_bytes(rsa_private);
            })
        })
    }

    /// SubjectPublicKeyInfo of an RSA or DSA key.
    pub fn spki(key: &PublicKey) -> Result<Vec<u8>> {
        match key.mpis() {
            mpi::PublicKey::RSA { e, n } => {
                // RFC3279 Sec. 2.3.1
                let rsa_pub = yasna::construct_der(|w| {
                    w.write_sequence(|w| {
                        w.next().write_biguint(&biguint(n.value()));
                        w.next().write_biguint(&biguint(e.value()));
                    })
                });
                Ok(yasna::construct_der(|w| {
                    w.write_sequence(|w| {
                        write_algorithm(w.next(), &RSA_ENCRYPTION);
                        w.next().write_bitvec(&BitVec::from_bytes(&rsa_pub));
                    })
                }))
            }
            mpi::PublicKey::DSA { p, q, g, y } => {
                // RFC3279 Sec. 2.3.2
                let dsa_pub = yasna::construct_der(|w| {
                    w.write_biguint(&biguint(y.value()));
                });
                Ok(yasna::construct_der(|w| {
                    w.write_sequence(|w| {
                        w.next().write_sequence(|w| {
                            w.next().write_oid(&DSA);
                            w.next().write_sequence(|w| {
                                for m in [p, q, g].iter() {
                                    w.next().write_biguint(&biguint(m.value()));
                                }
                            });
                        });
                        w.next().write_bitvec(&BitVec::from_bytes(&dsa_pub));
                    })
                }))
            }
            _ => Err(Error::UnsupportedAlgorithm(key.pk_algo()).into()),
        }
    }

    /// An X.501 Name: one O and one CN per entry of `common_names`.
    pub fn name(organization: &str, common_names: &[String]) -> Vec<u8> {
        fn rdn(w: yasna::DERWriter, oid: &Oid, value: &str) {
            w.write_set(|w| {
                w.next().write_sequence(|w| {
                    w.next().write_oid(oid);
                    w.next().write_utf8_string(value);
                })
            })
        }

        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                rdn(w.next(), &ORGANIZATION, organization);
                for cn in common_names {
                    rdn(w.next(), &COMMON_NAME, cn);
                }
            })
        })
    }

    fn time(w: yasna::DERWriter, t: SystemTime) {
        // RFC5280 Sec. 4.1.2.5: UTCTime through 2049.
        let t: chrono::DateTime<chrono::Utc> = t.into();
        if chrono::Datelike::year(&t) < 2050 {
            let s = t.format("%y%m%d%H%M%SZ").to_string();
            w.write_tagged_implicit(yasna::tags::TAG_UTCTIME,
                                    |w| w.write_bytes(s.as_bytes()));
        } else {
            let s = t.format("%Y%m%d%H%M%SZ").to_string();
            w.write_tagged_implicit(yasna::tags::TAG_GENERALIZEDTIME,
                                    |w| w.write_bytes(s.as_bytes()));
        }
    }

    /// Validity period.
    pub fn validity(not_before: SystemTime, not_after: SystemTime) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                time(w.next(), not_before);
                time(w.next(), not_after);
            })
        })
    }

    fn named_bits(len: usize, set: &[usize]) -> Vec<u8> {
        let mut bits = BitVec::from_elem(len, false);
        for i in set {
            bits.set(*i, true);
        }
        yasna::construct_der(|w| w.write_bitvec(&bits))
    }

    /// A single extension.
    pub struct Extension {
        pub oid: Oid,
        pub critical: bool,
        pub value: Vec<u8>,
    }

    /// The extensions of a bridge certificate.
    pub fn bridge_extensions(spki: &[u8], xmpp_addrs: &[String],
                             public_ring: &[u8]) -> Result<Vec<Extension>> {
        use sha1::{Digest, Sha1};

        let key_id = Sha1::digest(&parse::spki_key_bits(spki)?).to_vec();

        let mut extensions = vec![
            Extension {
                oid: BASIC_CONSTRAINTS.clone(),
                critical: true,
                value: yasna::construct_der(|w| {
                    w.write_sequence(|w| w.next().write_bool(true))
                }),
            },
            // digitalSignature, nonRepudiation, keyEncipherment,
            // keyAgreement, keyCertSign
            Extension {
                oid: KEY_USAGE.clone(),
                critical: true,
                value: named_bits(6, &[0, 1, 2, 4, 5]),
            },
            // sslClient, smime
            Extension {
                oid: NETSCAPE_CERT_TYPE.clone(),
                critical: false,
                value: named_bits(3, &[0, 2]),
            },
            Extension {
                oid: SUBJECT_KEY_IDENTIFIER.clone(),
                critical: false,
                value: yasna::construct_der(|w| w.write_bytes(&key_id)),
            },
            Extension {
                oid: AUTHORITY_KEY_IDENTIFIER.clone(),
                critical: false,
                value: yasna::construct_der(|w| {
                    w.write_sequence(|w| {
                        w.next().write_tagged_implicit(
                            Tag::context(0), |w| w.write_bytes(&key_id));
                    })
                }),
            },
        ];

        if ! xmpp_addrs.is_empty() {
            // otherName [0] IMPLICIT SEQUENCE {
            //   type-id    OBJECT IDENTIFIER,
            //   value      [0] EXPLICIT UTF8String
            // }
            let names = yasna::construct_der(|w| {
                w.write_sequence(|w| {
                    for addr in xmpp_addrs {
                        w.next().write_tagged_implicit(Tag::context(0), |w| {
                            w.write_sequence(|w| {
                                w.next().write_oid(&XMPP_ADDR);
                                w.next().write_tagged(Tag::context(0), |w| {
                                    w.write_utf8_string(addr)
                                });
                            })
                        });
                    }
                })
            });
            extensions.push(Extension {
                oid: SUBJECT_ALT_NAME.clone(),
                critical: false,
                value: names,
            });
        }

        extensions.push(Extension {
            oid: PGP_PUBLIC_KEY.clone(),
            critical: false,
            value: yasna::construct_der(|w| {
                w.write_bitvec(&BitVec::from_bytes(public_ring))
            }),
        });

        Ok(extensions)
    }

    /// TBSCertificate, version 3.
    pub fn tbs_certificate(serial: u32, signature: &Oid, name: &[u8],
                           validity: &[u8], spki: &[u8],
                           extensions: &[Extension]) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_tagged(Tag::context(0), |w| w.write_u32(2));
                w.next().write_u32(serial);
                write_algorithm(w.next(), signature);
                w.next().write_der(name);
                w.next().write_der(validity);
                w.next().write_der(name);
                w.next().write_der(spki);
                w.next().write_tagged(Tag::context(3), |w| {
                    w.write_sequence(|w| {
                        for ext in extensions {
                            w.next().write_sequence(|w| {
                                w.next().write_oid(&ext.oid);
                                if ext.critical {
                                    w.next().write_bool(true);
                                }
                                w.next().write_bytes(&ext.value);
                            });
                        }
                    })
                });
            })
        })
    }

    /// The signed certificate.
    pub fn certificate(tbs: &[u8], signature: &Oid, value: &[u8]) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_der(tbs);
                write_algorithm(w.next(), signature);
                w.next().write_bitvec(&BitVec::from_bytes(value));
            })
        })
    }

    /// A DSA signature value.
    pub fn dsa_signature(r: &[u8], s: &[u8]) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_sequence(|w| {
                w.next().write_biguint(&biguint(r));
                w.next().write_biguint(&biguint(s));
            })
        })
    }
}

pub mod parse {
    use super::*;

    /// The parts of a certificate the bridge cares about.
    pub struct Certificate {
        pub tbs: Vec<u8>,
        pub signature_algorithm: Oid,
        pub signature: Vec<u8>,
        pub spki: Vec<u8>,
        pub extensions: Vec<(Oid, bool, Vec<u8>)>,
    }

    impl Certificate {
        /// Returns the value of the extension `oid`.
        pub fn extension(&self, oid: &Oid) -> Option<&[u8]> {
            self.extensions.iter()
                .find(|(o, _, _)| o == oid)
                .map(|(_, _, v)| &v[..])
        }
    }

    fn read_algorithm(r: yasna::BERReader) -> yasna::ASN1Result<Oid> {
        r.read_sequence(|r| {
            let oid = r.next().read_oid()?;
            r.read_optional(|r| r.read_der())?;
            Ok(oid)
        })
    }

    pub fn certificate(der: &[u8]) -> Result<Certificate> {
        yasna::parse_der(der, |r| {
            r.read_sequence(|r| {
                let tbs = r.next().read_der()?;
                let signature_algorithm = read_algorithm(r.next())?;
                let (signature, _) = r.next().read_bitvec_bytes()?;

                let (spki, extensions) = yasna::parse_der(&tbs, |r| {
                    r.read_sequence(|r| {
                        r.read_optional(|r| {
                            r.read_tagged(Tag::context(0), |r| r.read_u32())
                        })?;
                        let _serial = r.next().read_biguint()?;
                        let _signature = r.next().read_der()?;
                        let _issuer = r.next().read_der()?;
                        let _validity = r.next().read_der()?;
                        let _subject = r.next().read_der()?;
                        let spki = r.next().read_der()?;
                        let extensions = r.read_optional(|r| {
                            r.read_tagged(Tag::context(3), |r| {
                                r.collect_sequence_of(|r| {
                                    r.read_sequence(|r| {
                                        let oid = r.next().read_oid()?;
                                        let critical = r.read_default(
                                            false, |r| r.read_bool())?;
                                        let value = r.next().read_bytes()?;
                                        Ok((oid, critical, value))
                                    })
                                })
                            })
                        })?;
                        Ok((spki, extensions.unwrap_or_default()))
                    })
                })?;

                Ok(Certificate {
                    tbs,
                    signature_algorithm,
                    signature,
                    spki,
                    extensions,
                })
            })
        })
        .map_err(|e| Error::InvalidData(format!("bad certificate: {}", e)).into())
    }

    /// The subjectPublicKey bits of a SubjectPublicKeyInfo.
    pub fn spki_key_bits(spki: &[u8]) -> Result<Vec<u8>> {
        Ok(yasna::parse_der(spki, |r| {
            r.read_sequence(|r| {
                let _algorithm = r.next().read_der()?;
                let (bits, _) = r.next().read_bitvec_bytes()?;
                Ok(bits)
            })
        })?)
    }

    /// The RSA or DSA key of a SubjectPublicKeyInfo.
    pub fn spki(spki: &[u8]) -> Result<Key4<PublicParts, UnspecifiedRole>> {
        let (pk_algo, mpis) = yasna::parse_der(spki, |r| {
            r.read_sequence(|r| {
                let (oid, params) = r.next().read_sequence(|r| {
                    let oid = r.next().read_oid()?;
                    let params = r.read_optional(|r| r.read_der())?;
                    Ok((oid, params))
                })?;
                let (bits, _) = r.next().read_bitvec_bytes()?;

                if oid == *RSA_ENCRYPTION {
                    yasna::parse_der(&bits, |r| {
                        r.read_sequence(|r| {
                            let n = read_mpi(r.next())?;
                            let e = read_mpi(r.next())?;
                            Ok((PublicKeyAlgorithm::RSAEncryptSign,
                                mpi::PublicKey::RSA { e, n }))
                        })
                    })
                } else if oid == *DSA {
                    let params = params.ok_or_else(
                        || ASN1Error::new(ASN1ErrorKind::Invalid))?;
                    let (p, q, g) = yasna::parse_der(&params, |r| {
                        r.read_sequence(|r| {
                            let p = read_mpi(r.next())?;
                            let q = read_mpi(r.next())?;
                            let g = read_mpi(r.next())?;
                            Ok((p, q, g))
                        })
                    })?;
                    let y = yasna::parse_der(&bits, read_mpi)?;
                    Ok((PublicKeyAlgorithm::DSA,
                        mpi::PublicKey::DSA { p, q, g, y }))
                } else {
                    Err(ASN1Error::new(ASN1ErrorKind::Invalid))
                }
            })
        })?;
        Key4::new(SystemTime::UNIX_EPOCH, pk_algo, mpis)
    }

    fn read_mpi(r: yasna::BERReader) -> yasna::ASN1Result<mpi::MPI> {
        Ok(mpi::MPI::new(&r.read_biguint()?.to_bytes_be()))
    }

    /// The r and s values of a Dss-Sig-Value.
    pub fn dsa_signature(buf: &[u8]) -> Result<mpi::Signature> {
        Ok(yasna::parse_der(buf, |r| {
            r.read_sequence(|r| {
                let r_ = read_mpi(r.next())?;
                let s = read_mpi(r.next())?;
                Ok(mpi::Signature::DSA { r: r_, s })
            })
        })?)
    }

    pub fn bit_string(buf: &[u8]) -> Result<Vec<u8>> {
        Ok(yasna::parse_der(buf, |r| r.read_bitvec_bytes())?.0)
    }

    /// The xmppAddr entries of a subjectAltName value.
    pub fn xmpp_addrs(buf: &[u8]) -> Result<Vec<String>> {
        Ok(yasna::parse_der(buf, |r| {
            r.collect_sequence_of(|r| {
                r.read_tagged_implicit(Tag::context(0), |r| {
                    r.read_sequence(|r| {
                        let oid = r.next().read_oid()?;
                        let value = r.next().read_tagged(Tag::context(0), |r| {
                            r.read_utf8string()
                        })?;
                        if oid == *XMPP_ADDR {
                            Ok(value)
                        } else {
                            Err(ASN1Error::new(ASN1ErrorKind::Invalid))
                        }
                    })
                })
            })
        })?)
    }
}

/// Checks a SHA-1 signature over `data`.
///
/// The signature value is DER for DSA and the raw integer for RSA.
pub fn verify(key: &Key4<PublicParts, UnspecifiedRole>, algorithm: &Oid,
              data: &[u8], signature: &[u8]) -> Result<()>
{
    use sha1::{Digest, Sha1};

    let sig = match key.mpis() {
        mpi::PublicKey::RSA { .. } if *algorithm == *SHA1_WITH_RSA =>
            mpi::Signature::RSA { s: mpi::MPI::new(signature) },
        mpi::PublicKey::DSA { .. } if *algorithm == *DSA_WITH_SHA1 =>
            parse::dsa_signature(signature)?,
        _ => return Err(Error::InvalidData(
            "signature algorithm does not match key".into()).into()),
    };
    openpgp::packet::Key::from(key.clone())
        .verify(&sig, HashAlgorithm::SHA1, &Sha1::digest(data))
}
