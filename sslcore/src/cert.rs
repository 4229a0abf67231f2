//! Certificate and key material, and the per-cipher capability masks
//! derived from it.
//!
//! Certificates here are descriptive: they carry the attributes cipher
//! selection and chain matching look at (names, key algorithm and size,
//! signature algorithm, key usage). Parsing and signature checks belong to
//! an X.509 engine plugged in through [`CertificateVerifier`].

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    cipher::{Algorithms, CipherSuite},
    error::{Error, ErrorKind, Result},
};

/// Public key algorithm of a certificate or private key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA
    Rsa,
    /// DSA
    Dsa,
    /// Static Diffie-Hellman
    Dh,
    /// Elliptic curve
    Ec,
}

/// Algorithm the issuer signed a certificate with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// md2WithRSAEncryption
    Md2WithRsa,
    /// md4WithRSAEncryption
    Md4WithRsa,
    /// md5WithRSAEncryption
    Md5WithRsa,
    /// sha1WithRSAEncryption
    Sha1WithRsa,
    /// dsaWithSHA1
    DsaWithSha1,
    /// ecdsa-with-SHA1
    EcdsaWithSha1,
}

impl SignatureAlgorithm {
    /// Signed by an RSA key
    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::Md2WithRsa | Self::Md4WithRsa | Self::Md5WithRsa | Self::Sha1WithRsa
        )
    }

    /// Signed by an ECDSA key
    pub fn is_ecdsa(self) -> bool {
        self == Self::EcdsaWithSha1
    }

    fn code(self) -> u8 {
        match self {
            Self::Md2WithRsa => 1,
            Self::Md4WithRsa => 2,
            Self::Md5WithRsa => 3,
            Self::Sha1WithRsa => 4,
            Self::DsaWithSha1 => 5,
            Self::EcdsaWithSha1 => 6,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Md2WithRsa,
            2 => Self::Md4WithRsa,
            3 => Self::Md5WithRsa,
            4 => Self::Sha1WithRsa,
            5 => Self::DsaWithSha1,
            6 => Self::EcdsaWithSha1,
            _ => return None,
        })
    }
}

impl KeyAlgorithm {
    fn code(self) -> u8 {
        match self {
            Self::Rsa => 1,
            Self::Dsa => 2,
            Self::Dh => 3,
            Self::Ec => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Rsa,
            2 => Self::Dsa,
            3 => Self::Dh,
            4 => Self::Ec,
            _ => return None,
        })
    }
}

bitflags! {
    /// The X.509 key usage extension.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct KeyUsage: u16 {
        /// digitalSignature
        const DIGITAL_SIGNATURE = 0x0080;
        /// nonRepudiation
        const NON_REPUDIATION = 0x0040;
        /// keyEncipherment
        const KEY_ENCIPHERMENT = 0x0020;
        /// dataEncipherment
        const DATA_ENCIPHERMENT = 0x0010;
        /// keyAgreement
        const KEY_AGREEMENT = 0x0008;
        /// keyCertSign
        const KEY_CERT_SIGN = 0x0004;
        /// cRLSign
        const CRL_SIGN = 0x0002;
    }
}

fn random_key_id() -> Result<u64> {
    getrandom::u64().map_err(|_| Error::fatal(ErrorKind::InternalError("random source unavailable")))
}

/// A private key. Only its identity is modelled: a certificate belongs to
/// a key when both carry the same key id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivateKey {
    algorithm: KeyAlgorithm,
    bits: u32,
    key_id: u64,
    passphrase: Option<String>,
}

impl PrivateKey {
    /// A fresh key of the given algorithm and size
    pub fn generate(algorithm: KeyAlgorithm, bits: u32) -> Result<Self> {
        Ok(Self {
            algorithm,
            bits,
            key_id: random_key_id()?,
            passphrase: None,
        })
    }

    /// Protects the key with a passphrase
    pub fn encrypted(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Whether a passphrase is needed before the key can be used
    pub fn is_encrypted(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Removes the passphrase protection
    pub fn decrypt(&self, passphrase: Option<&str>) -> Result<Self> {
        match (&self.passphrase, passphrase) {
            (None, _) => Ok(self.clone()),
            (Some(expected), Some(given)) if expected == given => Ok(Self {
                passphrase: None,
                ..self.clone()
            }),
            _ => Err(Error::fatal(ErrorKind::BadPassword)),
        }
    }

    /// Key algorithm
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Key size in bits
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

/// A certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    issuer: String,
    key_algorithm: KeyAlgorithm,
    key_bits: u32,
    key_id: u64,
    signature: SignatureAlgorithm,
    key_usage: Option<KeyUsage>,
}

impl Certificate {
    /// Issues a certificate for `key`
    pub fn issue(
        subject: impl Into<String>,
        issuer: impl Into<String>,
        key: &PrivateKey,
        signature: SignatureAlgorithm,
    ) -> Self {
        Self {
            subject: subject.into(),
            issuer: issuer.into(),
            key_algorithm: key.algorithm,
            key_bits: key.bits,
            key_id: key.key_id,
            signature,
            key_usage: None,
        }
    }

    /// Adds a key usage extension
    pub fn with_key_usage(mut self, usage: KeyUsage) -> Self {
        self.key_usage = Some(usage);
        self
    }

    /// Subject name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer name
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Public key algorithm
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Public key size in bits
    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    /// Signature algorithm
    pub fn signature(&self) -> SignatureAlgorithm {
        self.signature
    }

    /// Key usage extension, if present
    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.key_usage
    }

    /// Self signed
    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    /// Whether `key` is the private half of this certificate's key
    pub fn matches_key(&self, key: &PrivateKey) -> bool {
        self.key_id == key.key_id && self.key_algorithm == key.algorithm
    }

    /// Rejected by its key usage extension for `usage`
    fn ku_reject(&self, usage: KeyUsage) -> bool {
        self.key_usage.is_some_and(|ku| !ku.intersects(usage))
    }

    fn allows(&self, usage: KeyUsage) -> bool {
        !self.ku_reject(usage)
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        for name in [&self.subject, &self.issuer] {
            out.put_u16(name.len() as u16);
            out.put_slice(name.as_bytes());
        }
        out.put_u8(self.key_algorithm.code());
        out.put_u32(self.key_bits);
        out.put_u64(self.key_id);
        out.put_u8(self.signature.code());
        match self.key_usage {
            Some(ku) => {
                out.put_u8(1);
                out.put_u16(ku.bits());
            }
            None => out.put_u8(0),
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        let bad = || Error::fatal(ErrorKind::DecodeError("certificate"));
        let name = |buf: &mut Bytes| -> Result<String> {
            if buf.remaining() < 2 {
                return Err(bad());
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(bad());
            }
            String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| bad())
        };
        let subject = name(buf)?;
        let issuer = name(buf)?;
        if buf.remaining() < 1 + 4 + 8 + 1 + 1 {
            return Err(bad());
        }
        let key_algorithm = KeyAlgorithm::from_code(buf.get_u8()).ok_or_else(bad)?;
        let key_bits = buf.get_u32();
        let key_id = buf.get_u64();
        let signature = SignatureAlgorithm::from_code(buf.get_u8()).ok_or_else(bad)?;
        let key_usage = match buf.get_u8() {
            0 => None,
            _ if buf.remaining() >= 2 => Some(KeyUsage::from_bits_retain(buf.get_u16())),
            _ => return Err(bad()),
        };
        Ok(Self {
            subject,
            issuer,
            key_algorithm,
            key_bits,
            key_id,
            signature,
            key_usage,
        })
    }
}

/// A temporary key used for ephemeral key exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TmpKey {
    /// Key size in bits
    pub bits: u32,
}

/// Produces a temporary key on demand. Arguments are whether an export
/// suite was negotiated, and the maximum key length that suite permits.
pub type TmpKeyCallback = Arc<dyn Fn(bool, u32) -> Option<TmpKey> + Send + Sync>;

/// Slots of a [`CertSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySlot {
    /// RSA key usable for key transport
    RsaEnc,
    /// RSA signing key
    RsaSign,
    /// DSA signing key
    DsaSign,
    /// DH key in an RSA signed certificate
    DhRsa,
    /// DH key in a DSA signed certificate
    DhDsa,
    /// Elliptic curve key
    Ecc,
}

const SLOT_COUNT: usize = 6;

impl KeySlot {
    fn index(self) -> usize {
        self as usize
    }

    /// The slot a certificate naturally goes into
    pub fn for_certificate(cert: &Certificate) -> Self {
        match cert.key_algorithm {
            KeyAlgorithm::Rsa => Self::RsaEnc,
            KeyAlgorithm::Dsa => Self::DsaSign,
            KeyAlgorithm::Dh if cert.signature.is_rsa() => Self::DhRsa,
            KeyAlgorithm::Dh => Self::DhDsa,
            KeyAlgorithm::Ec => Self::Ecc,
        }
    }
}

/// A certificate and its private key.
#[derive(Clone, Debug, Default)]
pub struct CertKey {
    /// The certificate
    pub certificate: Option<Certificate>,
    /// Its private key
    pub private_key: Option<PrivateKey>,
}

impl CertKey {
    fn is_complete(&self) -> bool {
        self.certificate.is_some() && self.private_key.is_some()
    }

    fn key_bits(&self) -> u32 {
        self.private_key.as_ref().map_or(0, |k| k.bits)
    }
}

/// The algorithms a certificate set can support, in general and under
/// export restrictions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CertMasks {
    /// Usable key exchange and authentication bits
    pub mask: Algorithms,
    /// The same, restricted to export key sizes
    pub export_mask: Algorithms,
}

/// Maximum ECC key size for export suites.
const EXPORT_ECC_BITS: u32 = 163;

/// Certificates, keys and temporary key material of a context or a
/// connection.
#[derive(Default)]
pub struct CertSet {
    keys: [CertKey; SLOT_COUNT],
    current: Option<KeySlot>,
    rsa_tmp: Option<TmpKey>,
    rsa_tmp_cb: Option<TmpKeyCallback>,
    dh_tmp: Option<TmpKey>,
    dh_tmp_cb: Option<TmpKeyCallback>,
    ecdh_tmp: Option<TmpKey>,
    ecdh_tmp_cb: Option<TmpKeyCallback>,
    // Last computed masks, keyed by export key length
    masks: Mutex<Option<(u32, CertMasks)>>,
}

impl Clone for CertSet {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            current: self.current,
            rsa_tmp: self.rsa_tmp,
            rsa_tmp_cb: self.rsa_tmp_cb.clone(),
            dh_tmp: self.dh_tmp,
            dh_tmp_cb: self.dh_tmp_cb.clone(),
            ecdh_tmp: self.ecdh_tmp,
            ecdh_tmp_cb: self.ecdh_tmp_cb.clone(),
            masks: Mutex::new(*self.masks.lock()),
        }
    }
}

impl std::fmt::Debug for CertSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertSet")
            .field("keys", &self.keys)
            .field("current", &self.current)
            .field("rsa_tmp", &self.rsa_tmp)
            .field("dh_tmp", &self.dh_tmp)
            .field("ecdh_tmp", &self.ecdh_tmp)
            .finish_non_exhaustive()
    }
}

impl CertSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate(&mut self) {
        *self.masks.get_mut() = None;
    }

    /// Installs a certificate in its natural slot. A private key already in
    /// that slot which does not belong to the certificate is dropped.
    pub fn set_certificate(&mut self, cert: Certificate) {
        let slot = KeySlot::for_certificate(&cert);
        let entry = &mut self.keys[slot.index()];
        if entry
            .private_key
            .as_ref()
            .is_some_and(|k| !cert.matches_key(k))
        {
            log::debug!("Dropping private key not matching new certificate in {slot:?}");
            entry.private_key = None;
        }
        entry.certificate = Some(cert);
        self.current = Some(slot);
        self.invalidate();
    }

    /// Installs a private key next to its certificate
    pub fn set_private_key(&mut self, key: PrivateKey) -> Result<()> {
        if key.is_encrypted() {
            return Err(Error::fatal(ErrorKind::BadPassword));
        }
        let slot = self
            .keys
            .iter()
            .position(|ck| ck.certificate.as_ref().is_some_and(|c| c.matches_key(&key)))
            .map(|i| SLOTS[i])
            .unwrap_or(match key.algorithm {
                KeyAlgorithm::Rsa => KeySlot::RsaEnc,
                KeyAlgorithm::Dsa => KeySlot::DsaSign,
                KeyAlgorithm::Dh => KeySlot::DhRsa,
                KeyAlgorithm::Ec => KeySlot::Ecc,
            });
        let entry = &mut self.keys[slot.index()];
        if entry
            .certificate
            .as_ref()
            .is_some_and(|c| !c.matches_key(&key))
        {
            return Err(Error::fatal(ErrorKind::KeyValuesMismatch));
        }
        entry.private_key = Some(key);
        self.current = Some(slot);
        self.invalidate();
        Ok(())
    }

    /// Places a certificate and key into a specific slot
    pub fn set_slot(&mut self, slot: KeySlot, cert: Certificate, key: PrivateKey) -> Result<()> {
        if !cert.matches_key(&key) {
            return Err(Error::fatal(ErrorKind::KeyValuesMismatch));
        }
        self.keys[slot.index()] = CertKey {
            certificate: Some(cert),
            private_key: Some(key),
        };
        self.current = Some(slot);
        self.invalidate();
        Ok(())
    }

    /// The certificate and key in `slot`
    pub fn slot(&self, slot: KeySlot) -> &CertKey {
        &self.keys[slot.index()]
    }

    /// Certificate of the most recently configured slot
    pub fn certificate(&self) -> Option<&Certificate> {
        self.current
            .and_then(|s| self.keys[s.index()].certificate.as_ref())
    }

    /// Private key of the most recently configured slot
    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.current
            .and_then(|s| self.keys[s.index()].private_key.as_ref())
    }

    /// Checks that the current certificate and key belong together
    pub fn check_private_key(&self) -> Result<()> {
        let cert = self
            .certificate()
            .ok_or(Error::fatal(ErrorKind::NoCertificateAssigned))?;
        let key = self
            .private_key()
            .ok_or(Error::fatal(ErrorKind::NoPrivateKeyAssigned))?;
        if cert.matches_key(key) {
            Ok(())
        } else {
            Err(Error::fatal(ErrorKind::KeyValuesMismatch))
        }
    }

    /// Sets the temporary RSA key
    pub fn set_tmp_rsa(&mut self, key: TmpKey) {
        self.rsa_tmp = Some(key);
        self.invalidate();
    }

    /// Sets the temporary RSA key callback
    pub fn set_tmp_rsa_callback(&mut self, cb: TmpKeyCallback) {
        self.rsa_tmp_cb = Some(cb);
        self.invalidate();
    }

    /// Sets the temporary DH parameters
    pub fn set_tmp_dh(&mut self, key: TmpKey) {
        self.dh_tmp = Some(key);
        self.invalidate();
    }

    /// Sets the temporary DH callback
    pub fn set_tmp_dh_callback(&mut self, cb: TmpKeyCallback) {
        self.dh_tmp_cb = Some(cb);
        self.invalidate();
    }

    /// Sets the temporary ECDH key
    pub fn set_tmp_ecdh(&mut self, key: TmpKey) {
        self.ecdh_tmp = Some(key);
        self.invalidate();
    }

    /// Sets the temporary ECDH callback
    pub fn set_tmp_ecdh_callback(&mut self, cb: TmpKeyCallback) {
        self.ecdh_tmp_cb = Some(cb);
        self.invalidate();
    }

    /// Whether a temporary RSA key is available without asking a callback
    pub fn has_tmp_rsa(&self) -> bool {
        self.rsa_tmp.is_some()
    }

    /// Obtains a temporary RSA key for `cipher`, asking the callback if no
    /// static one fits.
    pub(crate) fn tmp_rsa_for(&self, cipher: &CipherSuite) -> Option<TmpKey> {
        let kl = cipher.export_pkey_length();
        match (&self.rsa_tmp, &self.rsa_tmp_cb) {
            (Some(key), _) if !cipher.is_export() || key.bits <= kl => Some(*key),
            (_, Some(cb)) => cb(cipher.is_export(), kl),
            _ => None,
        }
    }

    pub(crate) fn tmp_dh_for(&self, cipher: &CipherSuite) -> Option<TmpKey> {
        match (&self.dh_tmp, &self.dh_tmp_cb) {
            (Some(key), _) => Some(*key),
            (None, Some(cb)) => cb(cipher.is_export(), cipher.export_pkey_length()),
            (None, None) => None,
        }
    }

    pub(crate) fn tmp_ecdh_for(&self, cipher: &CipherSuite) -> Option<TmpKey> {
        match (&self.ecdh_tmp, &self.ecdh_tmp_cb) {
            (Some(key), _) => Some(*key),
            (None, Some(cb)) => cb(cipher.is_export(), cipher.export_pkey_length()),
            (None, None) => None,
        }
    }

    /// Whether export RSA suites would need a temporary RSA key: none is
    /// set and the RSA key is missing or longer than 512 bits.
    pub fn need_tmp_rsa(&self) -> bool {
        let enc = &self.keys[KeySlot::RsaEnc.index()];
        self.rsa_tmp.is_none() && (enc.private_key.is_none() || enc.key_bits() > 512)
    }

    /// The capability masks for `cipher`'s export key length
    pub fn masks(&self, cipher: &CipherSuite) -> CertMasks {
        let kl = cipher.export_pkey_length();
        let mut cached = self.masks.lock();
        match *cached {
            Some((len, masks)) if len == kl => masks,
            _ => {
                let masks = self.compute_masks(kl);
                *cached = Some((kl, masks));
                masks
            }
        }
    }

    fn compute_masks(&self, kl: u32) -> CertMasks {
        let rsa_tmp = self.rsa_tmp.is_some() || self.rsa_tmp_cb.is_some();
        let rsa_tmp_export =
            self.rsa_tmp_cb.is_some() || self.rsa_tmp.is_some_and(|k| k.bits <= kl);
        let dh_tmp = self.dh_tmp.is_some() || self.dh_tmp_cb.is_some();
        let dh_tmp_export = self.dh_tmp_cb.is_some() || self.dh_tmp.is_some_and(|k| k.bits <= kl);
        let have_ecdh_tmp = self.ecdh_tmp.is_some() || self.ecdh_tmp_cb.is_some();

        let slot = |s: KeySlot| &self.keys[s.index()];
        let rsa_enc = slot(KeySlot::RsaEnc).is_complete();
        let rsa_enc_export = rsa_enc && slot(KeySlot::RsaEnc).key_bits() <= kl;
        let rsa_sign = slot(KeySlot::RsaSign).is_complete();
        let dsa_sign = slot(KeySlot::DsaSign).is_complete();
        let dh_rsa = slot(KeySlot::DhRsa).is_complete();
        let dh_rsa_export = dh_rsa && slot(KeySlot::DhRsa).key_bits() <= kl;
        let dh_dsa = slot(KeySlot::DhDsa).is_complete();
        let dh_dsa_export = dh_dsa && slot(KeySlot::DhDsa).key_bits() <= kl;
        let ecc = slot(KeySlot::Ecc);

        let mut mask = Algorithms::empty();
        let mut emask = Algorithms::empty();

        if rsa_enc || (rsa_tmp && rsa_sign) {
            mask |= Algorithms::K_RSA;
        }
        if rsa_enc_export || (rsa_tmp_export && (rsa_sign || rsa_enc)) {
            emask |= Algorithms::K_RSA;
        }

        if dh_tmp_export {
            emask |= Algorithms::K_EDH;
        }
        if dh_tmp {
            mask |= Algorithms::K_EDH;
        }

        if dh_rsa {
            mask |= Algorithms::K_DHR;
        }
        if dh_rsa_export {
            emask |= Algorithms::K_DHR;
        }
        if dh_dsa {
            mask |= Algorithms::K_DHD;
        }
        if dh_dsa_export {
            emask |= Algorithms::K_DHD;
        }

        if rsa_enc || rsa_sign {
            mask |= Algorithms::A_RSA;
            emask |= Algorithms::A_RSA;
        }
        if dsa_sign {
            mask |= Algorithms::A_DSS;
            emask |= Algorithms::A_DSS;
        }

        mask |= Algorithms::A_NULL;
        emask |= Algorithms::A_NULL;

        // An ECC certificate serves ECDH and/or ECDSA depending on its key
        // usage extension
        if let (Some(x), true) = (&ecc.certificate, ecc.is_complete()) {
            let small = x.key_bits <= EXPORT_ECC_BITS;
            if x.allows(KeyUsage::KEY_AGREEMENT) {
                if x.signature.is_rsa() {
                    mask |= Algorithms::K_ECDH | Algorithms::A_RSA;
                    if small {
                        emask |= Algorithms::K_ECDH | Algorithms::A_RSA;
                    }
                }
                if x.signature.is_ecdsa() {
                    mask |= Algorithms::K_ECDH | Algorithms::A_ECDSA;
                    if small {
                        emask |= Algorithms::K_ECDH | Algorithms::A_ECDSA;
                    }
                }
            }
            if x.allows(KeyUsage::DIGITAL_SIGNATURE) {
                mask |= Algorithms::A_ECDSA;
                emask |= Algorithms::A_ECDSA;
            }
        }

        if have_ecdh_tmp {
            mask |= Algorithms::K_ECDHE;
            emask |= Algorithms::K_ECDHE;
        }

        CertMasks {
            mask,
            export_mask: emask,
        }
    }

    /// Whether a server holding this set can negotiate `cipher`
    pub fn supports(&self, cipher: &CipherSuite) -> bool {
        let masks = self.masks(cipher);
        let alg = cipher.kx_auth();
        let mask = if cipher.is_export() {
            masks.export_mask
        } else {
            masks.mask
        };
        if alg & mask != alg {
            return false;
        }
        if alg.contains(Algorithms::K_ECDH)
            && alg.intersects(Algorithms::A_RSA | Algorithms::A_ECDSA)
        {
            return self.keys[KeySlot::Ecc.index()]
                .certificate
                .as_ref()
                .is_some_and(|x| check_srvr_ecc_cert_and_alg(x, cipher));
        }
        true
    }

    /// The slot whose certificate a server sends for `cipher`
    pub fn server_send_slot(&self, cipher: &CipherSuite) -> Result<KeySlot> {
        let kalg = cipher.kx_auth();
        // kECDH first: ECDH-RSA needs the ECC certificate, not the RSA one
        let slot = if kalg.contains(Algorithms::K_ECDH) || kalg.contains(Algorithms::A_ECDSA) {
            KeySlot::Ecc
        } else if kalg.contains(Algorithms::K_DHR) {
            KeySlot::DhRsa
        } else if kalg.contains(Algorithms::K_DHD) {
            KeySlot::DhDsa
        } else if kalg.contains(Algorithms::A_DSS) {
            KeySlot::DsaSign
        } else if kalg.contains(Algorithms::A_RSA) {
            if self.keys[KeySlot::RsaEnc.index()].certificate.is_none() {
                KeySlot::RsaSign
            } else {
                KeySlot::RsaEnc
            }
        } else {
            return Err(Error::fatal(ErrorKind::InternalError(
                "no certificate for anonymous suite",
            )));
        };
        Ok(slot)
    }

    /// The certificate a server sends for `cipher`
    pub fn get_server_send_cert(&self, cipher: &CipherSuite) -> Option<&Certificate> {
        self.server_send_slot(cipher)
            .ok()
            .and_then(|s| self.keys[s.index()].certificate.as_ref())
    }

    /// The key used to sign key exchange parameters for `cipher`
    pub fn get_sign_pkey(&self, cipher: &CipherSuite) -> Option<&PrivateKey> {
        let alg = cipher.algorithms;
        let key = |s: KeySlot| self.keys[s.index()].private_key.as_ref();
        if alg.contains(Algorithms::A_DSS) && key(KeySlot::DsaSign).is_some() {
            key(KeySlot::DsaSign)
        } else if alg.contains(Algorithms::A_RSA) {
            key(KeySlot::RsaSign).or_else(|| key(KeySlot::RsaEnc))
        } else if alg.contains(Algorithms::A_ECDSA) && key(KeySlot::Ecc).is_some() {
            key(KeySlot::Ecc)
        } else {
            None
        }
    }
}

const SLOTS: [KeySlot; SLOT_COUNT] = [
    KeySlot::RsaEnc,
    KeySlot::RsaSign,
    KeySlot::DsaSign,
    KeySlot::DhRsa,
    KeySlot::DhDsa,
    KeySlot::Ecc,
];

/// Whether an ECC server certificate fits `cipher`: key size for export
/// suites, key usage and the issuer's signature algorithm.
pub fn check_srvr_ecc_cert_and_alg(x: &Certificate, cipher: &CipherSuite) -> bool {
    let alg = cipher.algorithms;
    if cipher.is_export() && x.key_bits > EXPORT_ECC_BITS {
        return false;
    }
    if alg.contains(Algorithms::K_ECDH) {
        if x.ku_reject(KeyUsage::KEY_AGREEMENT) {
            return false;
        }
        if alg.contains(Algorithms::A_ECDSA) && !x.signature.is_ecdsa() {
            return false;
        }
        if alg.contains(Algorithms::A_RSA) && !x.signature.is_rsa() {
            return false;
        }
    } else if alg.contains(Algorithms::A_ECDSA) && x.ku_reject(KeyUsage::DIGITAL_SIGNATURE) {
        return false;
    }
    true
}

/// Verification succeeded.
pub const VERIFY_OK: i64 = 0;

/// Default maximum chain depth.
pub const DEFAULT_VERIFY_DEPTH: u32 = 100;

/// Reasons a certificate chain failed verification.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// No issuer for a certificate in the chain could be found
    #[error("unable to get issuer certificate")]
    UnableToGetIssuerCert,
    /// The chain is longer than the configured depth
    #[error("certificate chain too long")]
    CertChainTooLong,
    /// A trust anchor rejected the certificate
    #[error("certificate rejected")]
    CertRejected,
    /// The application's verify callback rejected the chain
    #[error("application verification failure")]
    ApplicationVerification,
}

impl VerifyError {
    /// Numeric code stored as the verify result
    pub fn code(self) -> i64 {
        match self {
            Self::UnableToGetIssuerCert => 2,
            Self::CertChainTooLong => 22,
            Self::CertRejected => 28,
            Self::ApplicationVerification => 50,
        }
    }
}

/// Certificate chain validation.
pub trait CertificateVerifier: Send + Sync {
    /// Checks `chain` (leaf first) against the trust anchors `roots`.
    fn verify(
        &self,
        chain: &[Certificate],
        roots: &[Certificate],
        depth: u32,
    ) -> std::result::Result<(), VerifyError>;
}

/// Links each certificate to its issuer by name until a trust anchor is
/// reached.
#[derive(Clone, Copy, Debug, Default)]
pub struct IssuerNameVerifier;

impl CertificateVerifier for IssuerNameVerifier {
    fn verify(
        &self,
        chain: &[Certificate],
        roots: &[Certificate],
        depth: u32,
    ) -> std::result::Result<(), VerifyError> {
        if chain.len() > depth as usize + 1 {
            return Err(VerifyError::CertChainTooLong);
        }
        for (i, cert) in chain.iter().enumerate() {
            if roots.iter().any(|r| r == cert) {
                return Ok(());
            }
            if roots.iter().any(|r| r.subject == cert.issuer) {
                return Ok(());
            }
            match chain.get(i + 1) {
                Some(next) if next.subject == cert.issuer => continue,
                _ => break,
            }
        }
        Err(VerifyError::UnableToGetIssuerCert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn suite(name: &str) -> &'static CipherSuite {
        CipherSuite::by_name(name).unwrap()
    }

    fn rsa_pair(bits: u32) -> (Certificate, PrivateKey) {
        let key = PrivateKey::generate(KeyAlgorithm::Rsa, bits).unwrap();
        let cert = Certificate::issue("server", "ca", &key, SignatureAlgorithm::Sha1WithRsa);
        (cert, key)
    }

    fn ecc_pair(bits: u32, sig: SignatureAlgorithm, ku: Option<KeyUsage>) -> (Certificate, PrivateKey) {
        let key = PrivateKey::generate(KeyAlgorithm::Ec, bits).unwrap();
        let mut cert = Certificate::issue("ecc", "ca", &key, sig);
        if let Some(ku) = ku {
            cert = cert.with_key_usage(ku);
        }
        (cert, key)
    }

    fn with_rsa(bits: u32) -> CertSet {
        let (cert, key) = rsa_pair(bits);
        let mut set = CertSet::new();
        set.set_certificate(cert);
        set.set_private_key(key).unwrap();
        set
    }

    #[test]
    fn rsa_certificate_masks() {
        let set = with_rsa(2048);
        let masks = set.masks(suite("AES128-SHA"));
        assert_eq!(
            masks.mask,
            Algorithms::K_RSA | Algorithms::A_RSA | Algorithms::A_NULL
        );
        // 2048 bits exceed the export limit
        assert_eq!(masks.export_mask, Algorithms::A_RSA | Algorithms::A_NULL);
    }

    #[test]
    fn tmp_rsa_enables_export_key_exchange() {
        let mut set = with_rsa(2048);
        assert!(!set.supports(suite("EXP-RC4-MD5")));
        set.set_tmp_rsa(TmpKey { bits: 512 });
        assert!(set.supports(suite("EXP-RC4-MD5")));
        assert_eq!(set.tmp_rsa_for(suite("EXP-RC4-MD5")), Some(TmpKey { bits: 512 }));
    }

    #[test_case(512 => true)]
    #[test_case(1024 => true)]
    #[test_case(2048 => false)]
    fn export56_key_length(bits: u32) -> bool {
        with_rsa(bits).supports(suite("EXP1024-RC4-SHA"))
    }

    #[test]
    fn dh_requires_tmp_parameters() {
        let mut set = with_rsa(2048);
        assert!(!set.supports(suite("DHE-RSA-AES128-SHA")));
        set.set_tmp_dh_callback(Arc::new(|_, bits| Some(TmpKey { bits })));
        assert!(set.supports(suite("DHE-RSA-AES128-SHA")));
        assert!(set.masks(suite("EXP-EDH-RSA-DES-CBC-SHA")).export_mask.contains(Algorithms::K_EDH));
    }

    #[test]
    fn anonymous_auth_needs_no_certificate() {
        let mut set = CertSet::new();
        assert!(set.masks(suite("ADH-AES128-SHA")).mask.contains(Algorithms::A_NULL));
        assert!(!set.supports(suite("AES128-SHA")));
        // ADH still needs DH parameters for the key exchange
        assert!(!set.supports(suite("ADH-AES128-SHA")));
        set.set_tmp_dh_callback(Arc::new(|_, bits| Some(TmpKey { bits })));
        assert!(set.supports(suite("ADH-AES128-SHA")));
    }

    #[test_case(SignatureAlgorithm::EcdsaWithSha1, None, "ECDH-ECDSA-AES128-SHA" => true)]
    #[test_case(SignatureAlgorithm::Md5WithRsa, None, "ECDH-ECDSA-AES128-SHA" => false)]
    #[test_case(SignatureAlgorithm::Md5WithRsa, None, "ECDH-RSA-AES128-SHA" => true)]
    #[test_case(SignatureAlgorithm::EcdsaWithSha1, Some(KeyUsage::DIGITAL_SIGNATURE), "ECDH-ECDSA-AES128-SHA" => false)]
    #[test_case(SignatureAlgorithm::EcdsaWithSha1, Some(KeyUsage::KEY_AGREEMENT), "ECDH-ECDSA-AES128-SHA" => true)]
    fn ecc_certificate_suites(sig: SignatureAlgorithm, ku: Option<KeyUsage>, name: &str) -> bool {
        let (cert, key) = ecc_pair(256, sig, ku);
        let mut set = CertSet::new();
        set.set_certificate(cert);
        set.set_private_key(key).unwrap();
        set.supports(suite(name))
    }

    #[test]
    fn ecdsa_needs_digital_signature_usage() {
        let (cert, _) = ecc_pair(256, SignatureAlgorithm::EcdsaWithSha1, Some(KeyUsage::KEY_AGREEMENT));
        assert!(!check_srvr_ecc_cert_and_alg(&cert, suite("ECDHE-ECDSA-AES128-SHA")));
        let (cert, _) = ecc_pair(256, SignatureAlgorithm::EcdsaWithSha1, Some(KeyUsage::DIGITAL_SIGNATURE));
        assert!(check_srvr_ecc_cert_and_alg(&cert, suite("ECDHE-ECDSA-AES128-SHA")));
    }

    #[test]
    fn adding_material_only_adds_bits() {
        let mut set = with_rsa(2048);
        let cipher = suite("AES128-SHA");
        let before = set.masks(cipher);

        let key = PrivateKey::generate(KeyAlgorithm::Dsa, 1024).unwrap();
        let cert = Certificate::issue("dsa", "ca", &key, SignatureAlgorithm::DsaWithSha1);
        set.set_certificate(cert);
        set.set_private_key(key).unwrap();
        set.set_tmp_ecdh(TmpKey { bits: 256 });

        let after = set.masks(cipher);
        assert!(after.mask.contains(before.mask));
        assert!(after.export_mask.contains(before.export_mask));
        assert!(after.mask.contains(Algorithms::A_DSS | Algorithms::K_ECDHE));
    }

    #[test]
    fn mask_cache_follows_export_length() {
        let set = with_rsa(1024);
        assert!(!set.masks(suite("EXP-RC4-MD5")).export_mask.contains(Algorithms::K_RSA));
        assert!(set.masks(suite("EXP1024-RC4-SHA")).export_mask.contains(Algorithms::K_RSA));
    }

    #[test]
    fn check_private_key_outcomes() {
        let set = CertSet::new();
        assert_eq!(
            set.check_private_key().unwrap_err().kind(),
            ErrorKind::NoCertificateAssigned
        );

        let (cert, key) = rsa_pair(2048);
        let mut set = CertSet::new();
        set.set_certificate(cert.clone());
        assert_eq!(
            set.check_private_key().unwrap_err().kind(),
            ErrorKind::NoPrivateKeyAssigned
        );

        let other = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        assert_eq!(
            set.set_private_key(other).unwrap_err().kind(),
            ErrorKind::KeyValuesMismatch
        );
        set.set_private_key(key).unwrap();
        set.check_private_key().unwrap();
    }

    #[test]
    fn new_certificate_drops_foreign_key() {
        let mut set = with_rsa(2048);
        let (cert, _) = rsa_pair(2048);
        set.set_certificate(cert);
        assert!(set.private_key().is_none());
    }

    #[test]
    fn encrypted_keys_need_passphrase() {
        let key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048)
            .unwrap()
            .encrypted("secret");
        assert_eq!(
            CertSet::new().set_private_key(key.clone()).unwrap_err().kind(),
            ErrorKind::BadPassword
        );
        assert_eq!(key.decrypt(Some("wrong")).unwrap_err().kind(), ErrorKind::BadPassword);
        assert_eq!(key.decrypt(None).unwrap_err().kind(), ErrorKind::BadPassword);
        assert!(!key.decrypt(Some("secret")).unwrap().is_encrypted());
    }

    #[test_case("AES128-SHA" => Some(KeySlot::RsaEnc))]
    #[test_case("DHE-DSS-AES128-SHA" => Some(KeySlot::DsaSign))]
    #[test_case("ECDH-RSA-AES128-SHA" => Some(KeySlot::Ecc))]
    #[test_case("ECDHE-RSA-AES128-SHA" => Some(KeySlot::RsaEnc))]
    #[test_case("DH-RSA-AES128-SHA" => Some(KeySlot::DhRsa))]
    #[test_case("ADH-AES128-SHA" => None)]
    fn server_send_slot(name: &str) -> Option<KeySlot> {
        with_rsa(2048).server_send_slot(suite(name)).ok()
    }

    #[test]
    fn rsa_sign_slot_when_no_enc_certificate() {
        let (cert, key) = rsa_pair(2048);
        let mut set = CertSet::new();
        set.set_slot(KeySlot::RsaSign, cert.clone(), key).unwrap();
        assert_eq!(set.server_send_slot(suite("AES128-SHA")).unwrap(), KeySlot::RsaSign);
        assert_eq!(set.get_server_send_cert(suite("AES128-SHA")), Some(&cert));
    }

    #[test]
    fn sign_key_preference() {
        let set = with_rsa(2048);
        assert!(set.get_sign_pkey(suite("DHE-RSA-AES128-SHA")).is_some());
        assert!(set.get_sign_pkey(suite("DHE-DSS-AES128-SHA")).is_none());
        assert!(set.get_sign_pkey(suite("ADH-AES128-SHA")).is_none());
    }

    #[test]
    fn clone_is_independent() {
        let set = with_rsa(2048);
        let mut copy = set.clone();
        copy.set_tmp_ecdh(TmpKey { bits: 256 });
        let cipher = suite("ECDHE-RSA-AES128-SHA");
        assert!(copy.supports(cipher));
        assert!(!set.supports(cipher));
    }

    #[test]
    fn certificate_wire_format() {
        let (cert, _) = ecc_pair(256, SignatureAlgorithm::EcdsaWithSha1, Some(KeyUsage::KEY_AGREEMENT));
        let mut out = BytesMut::new();
        cert.encode(&mut out);
        let mut bytes = out.freeze();
        assert_eq!(Certificate::decode(&mut bytes).unwrap(), cert);
        assert!(bytes.is_empty());

        let mut truncated = Bytes::from_static(&[0, 5, b'a']);
        assert!(Certificate::decode(&mut truncated).is_err());
    }

    fn chain() -> (Vec<Certificate>, Certificate) {
        let root_key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        let root = Certificate::issue("root", "root", &root_key, SignatureAlgorithm::Sha1WithRsa);
        let mid_key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
        let mid = Certificate::issue("intermediate", "root", &mid_key, SignatureAlgorithm::Sha1WithRsa);
        let (leaf, _) = {
            let key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
            (Certificate::issue("leaf", "intermediate", &key, SignatureAlgorithm::Sha1WithRsa), key)
        };
        (vec![leaf, mid], root)
    }

    #[test]
    fn issuer_name_verification() {
        let (chain, root) = chain();
        let verifier = IssuerNameVerifier;
        assert_eq!(verifier.verify(&chain, &[root.clone()], DEFAULT_VERIFY_DEPTH), Ok(()));
        assert_eq!(
            verifier.verify(&chain, &[], DEFAULT_VERIFY_DEPTH),
            Err(VerifyError::UnableToGetIssuerCert)
        );
        assert_eq!(
            verifier.verify(&chain, &[root], 0),
            Err(VerifyError::CertChainTooLong)
        );
        assert_eq!(
            verifier.verify(&[], &[], DEFAULT_VERIFY_DEPTH),
            Err(VerifyError::UnableToGetIssuerCert)
        );
    }
}
